use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ObjectId;

/// Routes served by the broker. The path strings are the wire contract,
/// see [`Route::path`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    SubscribeObject,
    SubscribeApplication,
    UpdateObject,
    Search,
}

impl Route {
    pub const ALL: [Route; 4] = [
        Route::SubscribeObject,
        Route::SubscribeApplication,
        Route::UpdateObject,
        Route::Search,
    ];

    pub fn path(&self) -> &'static str {
        match self {
            Route::SubscribeObject => "/subscribe/object",
            Route::SubscribeApplication => "/subscribe/application",
            Route::UpdateObject => "/update/object",
            Route::Search => "/search",
        }
    }

    pub fn from_path(path: &str) -> Option<Route> {
        Self::ALL.into_iter().find(|route| route.path() == path)
    }
}

/// Response statuses. Serialised into the reply body as `class * 100 +
/// detail`, so `Created` (2.01) is `201`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Created,
    Changed,
    Content,
    BadRequest,
    Unauthorized,
    NotFound,
    InternalError,
}

impl Status {
    pub fn as_u16(&self) -> u16 {
        match self {
            Status::Created => 201,
            Status::Changed => 204,
            Status::Content => 205,
            Status::BadRequest => 400,
            Status::Unauthorized => 401,
            Status::NotFound => 404,
            Status::InternalError => 500,
        }
    }

    pub fn from_u16(code: u16) -> Option<Status> {
        match code {
            201 => Some(Status::Created),
            204 => Some(Status::Changed),
            205 => Some(Status::Content),
            400 => Some(Status::BadRequest),
            401 => Some(Status::Unauthorized),
            404 => Some(Status::NotFound),
            500 => Some(Status::InternalError),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.as_u16() < 300
    }
}

/// Body of every response PDU
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

impl Reply {
    pub fn new(status: Status) -> Self {
        Self {
            status: status.as_u16(),
            id: None,
            response: None,
            info: None,
        }
    }

    pub fn with_id(mut self, id: ObjectId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_response(mut self, response: Value) -> Self {
        self.response = Some(response);
        self
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = Some(info.into());
        self
    }

    pub fn status(&self) -> Option<Status> {
        Status::from_u16(self.status)
    }

    /// Search results, empty when the reply carries none
    pub fn matches(&self) -> Vec<Endpoint> {
        self.response
            .as_ref()
            .and_then(|v| serde_json::from_value::<Vec<Endpoint>>(v.clone()).ok())
            .unwrap_or_default()
    }
}

/// Where a matched object can be addressed directly
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
}

impl Endpoint {
    pub fn socket_addr(&self) -> Option<std::net::SocketAddr> {
        let ip: std::net::IpAddr = self.ip.parse().ok()?;
        Some(std::net::SocketAddr::new(ip, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_route_resolves_from_its_path() {
        for route in Route::ALL {
            assert_eq!(Route::from_path(route.path()), Some(route));
        }
        assert_eq!(Route::from_path("/unsubscribe"), None);
        assert_eq!(Route::from_path("/search/"), None);
    }

    #[test]
    fn reply_omits_absent_fields() {
        let body = serde_json::to_string(&Reply::new(Status::Created).with_id(20001)).unwrap();
        assert_eq!(body, r#"{"status":201,"id":20001}"#);
    }

    #[test]
    fn search_matches_parse_from_reply() {
        let reply: Reply = serde_json::from_str(
            r#"{"status":205,"response":[{"ip":"10.0.0.4","port":19},{"ip":"::1","port":7}]}"#,
        )
        .unwrap();
        let matches = reply.matches();
        assert_eq!(matches.len(), 2);
        assert_eq!(
            matches[0].socket_addr(),
            Some("10.0.0.4:19".parse().unwrap())
        );
        assert_eq!(Reply::new(Status::Content).matches(), vec![]);
    }
}
