use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use market_bus_core::{RequestClient, SendOptions};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::response::ResponseDto;
use crate::{GatewayError, Result};

/// Every command the market worker pipeline accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandRoute {
    UserCreate,
    UserUpdate,
    UserDelete,
    UserUpdatePassword,
    StockCreate,
    StockUpdate,
    StockDelete,
    StockUpdateIndustryRatios,
    StockUpdateMatchPrice,
    SubscriptionCreate,
    SubscriptionUpdate,
    SubscriptionDelete,
    AhpConfigCreate,
    AhpConfigUpdate,
    StockYearDataCreate,
    StockYearDataUpdate,
    StockYearDataDelete,
}

impl CommandRoute {
    pub const ALL: [CommandRoute; 17] = [
        CommandRoute::UserCreate,
        CommandRoute::UserUpdate,
        CommandRoute::UserDelete,
        CommandRoute::UserUpdatePassword,
        CommandRoute::StockCreate,
        CommandRoute::StockUpdate,
        CommandRoute::StockDelete,
        CommandRoute::StockUpdateIndustryRatios,
        CommandRoute::StockUpdateMatchPrice,
        CommandRoute::SubscriptionCreate,
        CommandRoute::SubscriptionUpdate,
        CommandRoute::SubscriptionDelete,
        CommandRoute::AhpConfigCreate,
        CommandRoute::AhpConfigUpdate,
        CommandRoute::StockYearDataCreate,
        CommandRoute::StockYearDataUpdate,
        CommandRoute::StockYearDataDelete,
    ];

    /// The `uri` the worker dispatches on. Two routes keep a trailing slash;
    /// workers match them verbatim.
    pub fn uri(self) -> &'static str {
        match self {
            CommandRoute::UserCreate => "/user/create",
            CommandRoute::UserUpdate => "/user/update",
            CommandRoute::UserDelete => "/user/delete",
            CommandRoute::UserUpdatePassword => "/user/updatePassword",
            CommandRoute::StockCreate => "/stock/create",
            CommandRoute::StockUpdate => "/stock/update",
            CommandRoute::StockDelete => "/stock/delete",
            CommandRoute::StockUpdateIndustryRatios => "/stock/updateIndustryRatios",
            CommandRoute::StockUpdateMatchPrice => "/stock/updateMatchPrice/",
            CommandRoute::SubscriptionCreate => "/subscription/create",
            CommandRoute::SubscriptionUpdate => "/subscription/update",
            CommandRoute::SubscriptionDelete => "/subscription/delete",
            CommandRoute::AhpConfigCreate => "/ahpConfig/create",
            CommandRoute::AhpConfigUpdate => "/ahpConfig/update",
            CommandRoute::StockYearDataCreate => "/stockYearData/create",
            CommandRoute::StockYearDataUpdate => "/stockYearData/update/",
            CommandRoute::StockYearDataDelete => "/stockYearData/delete",
        }
    }
}

impl fmt::Display for CommandRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.uri())
    }
}

impl FromStr for CommandRoute {
    type Err = GatewayError;

    fn from_str(uri: &str) -> Result<Self> {
        CommandRoute::ALL
            .into_iter()
            .find(|route| route.uri() == uri)
            .ok_or_else(|| GatewayError::UnknownRoute(uri.to_string()))
    }
}

/// Entry point for the routing layer: one typed call per worker command.
#[derive(Clone)]
pub struct CommandGateway {
    client: Arc<RequestClient>,
    options: SendOptions,
}

impl CommandGateway {
    pub fn new(client: Arc<RequestClient>) -> Self {
        Self {
            client,
            options: SendOptions::new(),
        }
    }

    /// Options applied to every call, e.g. a shorter timeout.
    pub fn with_options(mut self, options: SendOptions) -> Self {
        self.options = options;
        self
    }

    pub fn client(&self) -> &Arc<RequestClient> {
        &self.client
    }

    pub async fn execute<P: Serialize>(
        &self,
        route: CommandRoute,
        payload: P,
    ) -> Result<ResponseDto<Value>> {
        self.execute_with(route, payload, self.options.clone()).await
    }

    /// Sends `payload` to `route` and unwraps the worker's [`ResponseDto`].
    pub async fn execute_with<P: Serialize>(
        &self,
        route: CommandRoute,
        payload: P,
        options: SendOptions,
    ) -> Result<ResponseDto<Value>> {
        let reply = self
            .client
            .send_and_wait::<_, Option<ResponseDto<Value>>>(route.uri(), payload, options)
            .await?;
        let key = reply.key.clone();

        match reply.into_payload() {
            Some(dto) => {
                if !dto.success {
                    debug!(
                        target: "gateway",
                        uri = %route,
                        key = %key,
                        error_code = dto.error_code,
                        "Worker reported failure"
                    );
                }
                Ok(dto)
            }
            None => {
                warn!(target: "gateway", uri = %route, key = %key, "Reply without payload");
                Err(GatewayError::MissingPayload {
                    uri: route.uri().to_string(),
                })
            }
        }
    }
}
