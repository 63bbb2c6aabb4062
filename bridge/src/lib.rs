pub mod commands;
pub mod local;
pub mod response;

pub use commands::{CommandGateway, CommandRoute};
pub use response::ResponseDto;

use market_bus_core::BusError;

#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("reply for {uri} carried no payload")]
    MissingPayload { uri: String },
    #[error("unknown command route: {0}")]
    UnknownRoute(String),
}

impl GatewayError {
    /// HTTP status a routing layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::Bus(BusError::Timeout { .. }) => 504,
            GatewayError::Bus(BusError::Connect(_) | BusError::Publish { .. }) => 503,
            GatewayError::Bus(BusError::InvalidKey { .. }) => 400,
            GatewayError::UnknownRoute(_) => 404,
            _ => 502,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_failure_kind() {
        let timeout = GatewayError::from(BusError::Timeout {
            key: "k".into(),
            timeout_ms: 15_000,
        });
        assert_eq!(timeout.status_code(), 504);
        assert_eq!(GatewayError::from(BusError::Connect("x".into())).status_code(), 503);
        assert_eq!(
            GatewayError::from(BusError::Publish {
                key: "k".into(),
                reason: "r".into()
            })
            .status_code(),
            503
        );
        assert_eq!(
            GatewayError::MissingPayload { uri: "/user/create".into() }.status_code(),
            502
        );
        assert_eq!(GatewayError::from(BusError::Closed).status_code(), 502);
        assert_eq!(
            GatewayError::from(BusError::InvalidKey {
                key: String::new(),
                reason: "key is empty".into()
            })
            .status_code(),
            400
        );
    }
}
