use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum PredictionError {
    #[error("`predictions` is not a list")]
    NotAList,
    #[error("Prediction {index}: missing field `{field}`")]
    MissingField { index: usize, field: &'static str },
    #[error("Prediction {index}: field `{field}` has an invalid value")]
    InvalidField { index: usize, field: &'static str },
}

/// Bounding box expressed as fractions of the image width and height.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizedBox {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub tag_name: String,
    pub probability: f64,
    pub bounding_box: NormalizedBox,
}

impl Prediction {
    pub fn confidence_percent(&self) -> f64 {
        self.probability * 100.0
    }
}

/// Extracts the predictions of a Custom Vision detection response.
///
/// A response without a `predictions` entry carries zero detections.
pub fn parse_predictions(response: &Value) -> Result<Vec<Prediction>, PredictionError> {
    let predictions = match response.get("predictions") {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(predictions)) => predictions,
        Some(_) => return Err(PredictionError::NotAList),
    };

    predictions
        .iter()
        .enumerate()
        .map(|(index, value)| parse_prediction(index, value))
        .collect()
}

fn parse_prediction(index: usize, value: &Value) -> Result<Prediction, PredictionError> {
    let fields = value
        .as_object()
        .ok_or(PredictionError::InvalidField { index, field: "prediction" })?;

    let tag_name = field(fields, index, "tagName")?
        .as_str()
        .ok_or(PredictionError::InvalidField { index, field: "tagName" })?
        .to_string();
    let probability = number(fields, index, "probability", "probability")?;

    let bounding_box = field(fields, index, "boundingBox")?
        .as_object()
        .ok_or(PredictionError::InvalidField { index, field: "boundingBox" })?;

    Ok(Prediction {
        tag_name,
        probability,
        bounding_box: NormalizedBox {
            left: number(bounding_box, index, "left", "boundingBox.left")?,
            top: number(bounding_box, index, "top", "boundingBox.top")?,
            width: number(bounding_box, index, "width", "boundingBox.width")?,
            height: number(bounding_box, index, "height", "boundingBox.height")?,
        },
    })
}

fn field<'a>(
    fields: &'a Map<String, Value>,
    index: usize,
    field: &'static str,
) -> Result<&'a Value, PredictionError> {
    fields
        .get(field)
        .ok_or(PredictionError::MissingField { index, field })
}

// `path` is the dotted name reported back to the caller.
fn number(
    fields: &Map<String, Value>,
    index: usize,
    key: &str,
    path: &'static str,
) -> Result<f64, PredictionError> {
    fields
        .get(key)
        .ok_or(PredictionError::MissingField { index, field: path })?
        .as_f64()
        .ok_or(PredictionError::InvalidField { index, field: path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_predictions() {
        let response = json!({
            "id": "0a1b",
            "project": "pests",
            "predictions": [
                {
                    "probability": 0.92,
                    "tagId": "t-1",
                    "tagName": "aphid",
                    "boundingBox": { "left": 0.1, "top": 0.2, "width": 0.3, "height": 0.4 }
                },
                {
                    "probability": 0.3,
                    "tagId": "t-2",
                    "tagName": "weevil",
                    "boundingBox": { "left": 0, "top": 0, "width": 1, "height": 1 }
                }
            ]
        });

        let predictions = parse_predictions(&response).unwrap();

        assert_eq!(predictions.len(), 2);
        assert_eq!(predictions[0].tag_name, "aphid");
        assert_eq!(predictions[0].probability, 0.92);
        assert_eq!(
            predictions[0].bounding_box,
            NormalizedBox {
                left: 0.1,
                top: 0.2,
                width: 0.3,
                height: 0.4
            }
        );
        assert_eq!(predictions[1].tag_name, "weevil");
        assert_eq!(predictions[1].bounding_box.width, 1.0);
    }

    #[test]
    fn test_probability_keeps_json_precision() {
        let response = json!({
            "predictions": [
                {
                    "probability": 0.50000001,
                    "tagName": "aphid",
                    "boundingBox": { "left": 0.1, "top": 0.1, "width": 0.1, "height": 0.1 }
                }
            ]
        });

        let predictions = parse_predictions(&response).unwrap();

        assert_eq!(predictions[0].probability, 0.50000001);
        assert!(predictions[0].confidence_percent() > 50.0);
    }

    #[test]
    fn test_missing_predictions_is_empty() {
        assert!(parse_predictions(&json!({ "id": "0a1b" })).unwrap().is_empty());
        assert!(parse_predictions(&json!({ "predictions": null }))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_predictions_must_be_a_list() {
        let err = parse_predictions(&json!({ "predictions": "aphid" })).unwrap_err();
        assert_eq!(err, PredictionError::NotAList);
    }

    #[test]
    fn test_non_numeric_field_names_index_and_field() {
        let response = json!({
            "predictions": [
                {
                    "probability": 0.8,
                    "tagName": "aphid",
                    "boundingBox": { "left": 0.1, "top": 0.1, "width": 0.1, "height": 0.1 }
                },
                {
                    "probability": 0.8,
                    "tagName": "mite",
                    "boundingBox": { "left": 0.1, "top": "high", "width": 0.1, "height": 0.1 }
                }
            ]
        });

        let err = parse_predictions(&response).unwrap_err();

        assert_eq!(
            err,
            PredictionError::InvalidField {
                index: 1,
                field: "boundingBox.top"
            }
        );
        assert_eq!(
            err.to_string(),
            "Prediction 1: field `boundingBox.top` has an invalid value"
        );
    }

    #[test]
    fn test_missing_field_is_reported() {
        let response = json!({
            "predictions": [
                { "tagName": "aphid", "boundingBox": { "left": 0.1, "top": 0.1, "width": 0.1 } }
            ]
        });
        assert_eq!(
            parse_predictions(&response).unwrap_err(),
            PredictionError::MissingField {
                index: 0,
                field: "probability"
            }
        );

        let response = json!({
            "predictions": [
                {
                    "probability": 0.6,
                    "tagName": "aphid",
                    "boundingBox": { "left": 0.1, "top": 0.1, "width": 0.1 }
                }
            ]
        });
        assert_eq!(
            parse_predictions(&response).unwrap_err(),
            PredictionError::MissingField {
                index: 0,
                field: "boundingBox.height"
            }
        );
    }
}
