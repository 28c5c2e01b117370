use crate::{
    error::{AddContext, ApiError},
    http::{Headers, Request},
    Result,
};
use serde::de::DeserializeOwned;

/// A trait for the HTTP protocol. Implementors accept a `Request` that wraps
/// headers, payloads and HTTP methods and return the raw `Response`. Clients
/// can potentially do HTTP calls against a remote server or mock the
/// responses for testing purposes.
///
/// HTTP statuses are data at this level: a 404 or a 503 is an `Ok(Response)`.
/// Only failures to obtain a response at all (connection refused, DNS, socket
/// timeouts) are errors. Runners are shared across attempt worker threads,
/// hence `Send + Sync`.
pub trait HttpRunner: Send + Sync {
    fn run(&self, request: &Request) -> Result<Response>;
}

/// Adapts lower level I/O HTTP outputs to a common Response.
#[derive(Clone, Debug, Default, PartialEq, Builder)]
pub struct Response {
    #[builder(default)]
    pub status: u16,
    #[builder(setter(into), default)]
    pub body: String,
    #[builder(default)]
    pub headers: Headers,
}

impl Response {
    pub fn builder() -> ResponseBuilder {
        ResponseBuilder::default()
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|s| s.as_str())
    }

    pub fn is_success(&self) -> bool {
        self.status < 400
    }

    pub fn is_server_error(&self) -> bool {
        self.status >= 500
    }

    /// Turn an HTTP failure status into an `ApiError::Http` carrying the
    /// status and its canonical reason.
    pub fn error_for_status(self) -> std::result::Result<Response, ApiError> {
        if self.is_success() {
            return Ok(self);
        }
        let message = ureq::http::StatusCode::from_u16(self.status)
            .ok()
            .and_then(|status| status.canonical_reason())
            .unwrap_or("Unknown status")
            .to_string();
        Err(ApiError::Http {
            status: self.status,
            message,
        })
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body)
            .map_err(|err| ApiError::SerializationError(err.to_string()))
            .err_context(format!(
                "Could not decode response body with status {}",
                self.status
            ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize, Debug, PartialEq)]
    struct Device {
        id: u32,
        name: String,
    }

    #[test]
    fn test_error_for_status_success_passes_through() {
        let response = Response::builder().status(200).body("{}").build().unwrap();
        assert_eq!(200, response.error_for_status().unwrap().status);
    }

    #[test]
    fn test_error_for_status_not_found() {
        let response = Response::builder().status(404).build().unwrap();
        let err = response.error_for_status().unwrap_err();
        assert_eq!(
            ApiError::Http {
                status: 404,
                message: "Not Found".to_string()
            },
            err
        );
    }

    #[test]
    fn test_error_for_status_unknown_code() {
        let response = Response::builder().status(599).build().unwrap();
        let err = response.error_for_status().unwrap_err();
        assert_eq!(Some(599), err.status());
    }

    #[test]
    fn test_response_json_decodes_body() {
        let response = Response::builder()
            .status(200)
            .body(r#"{"id": 1, "name": "aq_g5_01"}"#)
            .build()
            .unwrap();
        let device: Device = response.json().unwrap();
        assert_eq!(
            Device {
                id: 1,
                name: "aq_g5_01".to_string()
            },
            device
        );
    }

    #[test]
    fn test_response_json_invalid_body_is_serialization_error() {
        let response = Response::builder()
            .status(200)
            .body("not json")
            .build()
            .unwrap();
        let err = response.json::<Device>().unwrap_err();
        match err.downcast_ref::<ApiError>() {
            Some(ApiError::SerializationError(_)) => {}
            _ => panic!("Expected serialization error"),
        }
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let mut headers = Headers::new();
        headers.set("Content-Type", "application/json");
        let response = Response::builder().headers(headers).build().unwrap();
        assert_eq!(Some("application/json"), response.header("content-type"));
        assert_eq!(Some("application/json"), response.header("Content-Type"));
    }
}
