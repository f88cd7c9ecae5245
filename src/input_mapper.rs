//! Batch mapping of raw multimodal request data into engine inputs.
//!
//! A one-shot transform over a batch: no protocol, no shared state. Each
//! request yields an ordered list of mapped inputs, one per image.

use serde_json::{Map, Value};
use thiserror::Error;

use mq_engine_types::{GenerateRequest, MultiModalData};

/// Engine-ready inputs produced for one image.
pub type MultiModalInputs = Map<String, Value>;

#[derive(Debug, Error)]
#[error("failed to map multimodal input of request {request_id}: {message}")]
pub struct InputMapError {
    pub request_id: String,
    pub message: String,
}

/// Turns `{"image": ...}` plus processor kwargs into engine inputs.
pub trait ImageMapper {
    fn map_image(
        &self,
        image: &MultiModalData,
        mm_processor_kwargs: Option<&Map<String, Value>>,
    ) -> Result<MultiModalInputs, String>;
}

/// Per-request raw data, in request order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultiModalBatch {
    pub request_ids: Vec<String>,
    pub mm_data: Vec<Option<MultiModalData>>,
    pub mm_processor_kwargs: Vec<Option<Map<String, Value>>>,
}

impl MultiModalBatch {
    pub fn from_requests(requests: &[GenerateRequest]) -> Self {
        let mut batch = Self::default();
        for request in requests {
            batch.request_ids.push(request.request_id.clone());
            batch
                .mm_data
                .push(request.prompt_inputs.multi_modal_data().cloned());
            batch
                .mm_processor_kwargs
                .push(request.mm_processor_kwargs.clone());
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.request_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.request_ids.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappedBatch {
    pub request_ids: Vec<String>,
    pub mm_inputs: Vec<Vec<MultiModalInputs>>,
}

/// Map every request of `batch`.
///
/// A list under `"image"` with more than one entry is mapped item by item,
/// each wrapped in a one-element list. A single image, or a one-entry list,
/// is mapped as given. Requests without multimodal data get no inputs;
/// multimodal data without an `"image"` entry is an error for that request.
pub fn map_batch(
    mapper: &dyn ImageMapper,
    batch: &MultiModalBatch,
) -> Result<MappedBatch, InputMapError> {
    let mut mm_inputs = Vec::with_capacity(batch.len());

    for (i, request_id) in batch.request_ids.iter().enumerate() {
        let mut mapped = Vec::new();
        let data = batch.mm_data.get(i).and_then(Option::as_ref);
        let kwargs = batch.mm_processor_kwargs.get(i).and_then(Option::as_ref);

        if let Some(data) = data {
            let image_inputs = data.get("image").ok_or_else(|| InputMapError {
                request_id: request_id.clone(),
                message: "multimodal data has no \"image\" entry".to_string(),
            })?;
            let images: Vec<Value> = match image_inputs {
                Value::Array(items) if items.len() > 1 => items
                    .iter()
                    .map(|item| Value::Array(vec![item.clone()]))
                    .collect(),
                Value::Array(items) if items.is_empty() => Vec::new(),
                single => vec![single.clone()],
            };

            for image in images {
                let mut input = MultiModalData::new();
                input.insert("image".to_string(), image);
                let output =
                    mapper
                        .map_image(&input, kwargs)
                        .map_err(|message| InputMapError {
                            request_id: request_id.clone(),
                            message,
                        })?;
                mapped.push(output);
            }
        }
        mm_inputs.push(mapped);
    }

    Ok(MappedBatch {
        request_ids: batch.request_ids.clone(),
        mm_inputs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mq_engine_types::PromptInputs;
    use serde_json::json;
    use std::cell::RefCell;

    #[derive(Default)]
    struct RecordingMapper {
        calls: RefCell<Vec<Value>>,
    }

    impl ImageMapper for RecordingMapper {
        fn map_image(
            &self,
            image: &MultiModalData,
            mm_processor_kwargs: Option<&Map<String, Value>>,
        ) -> Result<MultiModalInputs, String> {
            let value = image.get("image").cloned().unwrap_or(Value::Null);
            if value == json!("corrupt") {
                return Err("cannot decode image".into());
            }
            self.calls.borrow_mut().push(value.clone());
            let mut out = Map::new();
            out.insert("pixel_values".into(), value);
            if let Some(kwargs) = mm_processor_kwargs {
                out.insert("kwargs".into(), Value::Object(kwargs.clone()));
            }
            Ok(out)
        }
    }

    fn request(id: &str, mm: Option<Value>) -> GenerateRequest {
        let mut request = GenerateRequest::text(id, "describe");
        request.prompt_inputs = PromptInputs::Text {
            prompt: "describe".into(),
            multi_modal_data: mm.and_then(|v| v.as_object().cloned()),
        };
        request
    }

    #[test]
    fn test_request_without_data_maps_to_nothing() {
        let mapper = RecordingMapper::default();
        let batch = MultiModalBatch::from_requests(&[request("a", None)]);
        let mapped = map_batch(&mapper, &batch).unwrap();
        assert_eq!(mapped.request_ids, vec!["a"]);
        assert_eq!(mapped.mm_inputs, vec![Vec::<MultiModalInputs>::new()]);
        assert!(mapper.calls.borrow().is_empty());
    }

    #[test]
    fn test_image_list_maps_each_item_wrapped() {
        let mapper = RecordingMapper::default();
        let batch = MultiModalBatch::from_requests(&[request(
            "a",
            Some(json!({"image": ["img0", "img1", "img2"]})),
        )]);
        let mapped = map_batch(&mapper, &batch).unwrap();
        assert_eq!(mapped.mm_inputs[0].len(), 3);
        assert_eq!(
            *mapper.calls.borrow(),
            vec![json!(["img0"]), json!(["img1"]), json!(["img2"])]
        );
    }

    #[test]
    fn test_single_image_and_single_entry_list_pass_through() {
        let mapper = RecordingMapper::default();
        let batch = MultiModalBatch::from_requests(&[
            request("a", Some(json!({"image": "img"}))),
            request("b", Some(json!({"image": ["only"]}))),
        ]);
        let mapped = map_batch(&mapper, &batch).unwrap();
        assert_eq!(mapped.mm_inputs[0].len(), 1);
        assert_eq!(mapped.mm_inputs[1].len(), 1);
        assert_eq!(*mapper.calls.borrow(), vec![json!("img"), json!(["only"])]);
    }

    #[test]
    fn test_processor_kwargs_reach_the_mapper() {
        let mapper = RecordingMapper::default();
        let mut req = request("a", Some(json!({"image": "img"})));
        req.mm_processor_kwargs = json!({"num_crops": 4}).as_object().cloned();
        let batch = MultiModalBatch::from_requests(&[req]);
        let mapped = map_batch(&mapper, &batch).unwrap();
        assert_eq!(mapped.mm_inputs[0][0]["kwargs"], json!({"num_crops": 4}));
    }

    #[test]
    fn test_mapper_failure_names_the_request() {
        let mapper = RecordingMapper::default();
        let batch = MultiModalBatch::from_requests(&[
            request("ok", Some(json!({"image": "img"}))),
            request("bad", Some(json!({"image": "corrupt"}))),
        ]);
        let err = map_batch(&mapper, &batch).unwrap_err();
        assert_eq!(err.request_id, "bad");
    }

    #[test]
    fn test_empty_image_list_maps_to_nothing() {
        let mapper = RecordingMapper::default();
        let batch = MultiModalBatch::from_requests(&[request("b", Some(json!({"image": []})))]);
        let mapped = map_batch(&mapper, &batch).unwrap();
        assert!(mapped.mm_inputs.iter().all(Vec::is_empty));
    }

    #[test]
    fn test_data_without_image_entry_is_rejected() {
        let mapper = RecordingMapper::default();
        let batch = MultiModalBatch::from_requests(&[
            request("ok", Some(json!({"image": "img"}))),
            request("audio", Some(json!({"audio": "clip"}))),
        ]);
        let err = map_batch(&mapper, &batch).unwrap_err();
        assert_eq!(err.request_id, "audio");
        assert!(err.message.contains("image"));
    }
}
