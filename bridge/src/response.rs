use serde::{Deserialize, Serialize};

/// Result body every market worker replies with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseDto<T = serde_json::Value> {
    pub success: bool,
    #[serde(default)]
    pub error_code: i64,
    pub error_message: Option<String>,
    pub data: Option<T>,
}

impl<T> ResponseDto<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            error_code: 0,
            error_message: None,
            data: Some(data),
        }
    }

    pub fn error(error_code: i64, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_code,
            error_message: Some(message.into()),
            data: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_worker_reply() {
        let dto: ResponseDto = serde_json::from_value(json!({
            "success": false,
            "errorCode": 409,
            "errorMessage": "stock already exists",
            "data": null
        }))
        .unwrap();
        assert_eq!(dto, ResponseDto::error(409, "stock already exists"));
    }

    #[test]
    fn missing_optional_fields_default() {
        let dto: ResponseDto = serde_json::from_value(json!({"success": true})).unwrap();
        assert_eq!(dto.error_code, 0);
        assert!(dto.data.is_none());
        assert_eq!(
            serde_json::to_value(ResponseDto::ok(1)).unwrap(),
            json!({"success": true, "errorCode": 0, "errorMessage": null, "data": 1})
        );
    }
}
