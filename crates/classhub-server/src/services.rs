//! External identity and unit-directory services.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use classhub_core::{DevicePrincipal, Identity, Principal, UnitId, UnitInfo, UserPrincipal};
use classhub_settings::ServiceSettings;

use crate::error::ServiceError;

/// Resolves bearer tokens to principals.
#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn resolve_token(&self, token: &str) -> Result<Principal, ServiceError>;
}

/// Unit metadata and per-unit roles.
#[async_trait]
pub trait UnitDirectory: Send + Sync {
    async fn unit_info(&self, unit: &UnitId) -> Result<UnitInfo, ServiceError>;

    /// Role of user `uid` within the unit.
    async fn unit_identity(&self, unit: &UnitId, uid: &str) -> Result<Identity, ServiceError>;

    /// True when the unit's course is both public and premium, in which
    /// case its reports are readable without a token.
    async fn is_open_access(&self, unit: &UnitId) -> Result<bool, ServiceError>;
}

/// `{"errcode":0,"errmsg":"OK","data":...}`
#[derive(Deserialize)]
struct ApiEnvelope<T> {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    data: Option<T>,
}

impl<T> ApiEnvelope<T> {
    fn into_data(self) -> Result<T, ServiceError> {
        if self.errcode != 0 {
            return Err(ServiceError::Upstream(self.errmsg));
        }
        self.data
            .ok_or_else(|| ServiceError::Decode("response has no data".to_string()))
    }
}

#[derive(Deserialize)]
struct UnitIdentityData {
    #[serde(default)]
    identity: String,
}

#[derive(Deserialize)]
struct UnitCourseData {
    #[serde(default)]
    course_id: String,
}

#[derive(Deserialize)]
struct CourseData {
    #[serde(default)]
    public: String,
    #[serde(default)]
    premium: String,
}

/// Build a principal from a token-introspection response. A `uid` means a
/// user; a `client_id` means a device whose type sits in
/// `config.device.device_type`.
pub fn principal_from_tokeninfo(info: Value) -> Result<Principal, ServiceError> {
    let non_empty = |key: &str| {
        info.get(key)
            .and_then(Value::as_str)
            .is_some_and(|s| !s.is_empty())
    };

    if non_empty("uid") {
        let user: UserPrincipal =
            serde_json::from_value(info).map_err(|e| ServiceError::Decode(e.to_string()))?;
        return Ok(Principal::User(user));
    }

    if non_empty("client_id") {
        let text = |ptr: &str| {
            info.pointer(ptr)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let device_type = info
            .pointer("/config/device/device_type")
            .and_then(|v| match v {
                Value::String(s) => s.trim().parse::<i64>().ok(),
                Value::Number(n) => n.as_i64(),
                _ => None,
            })
            .unwrap_or(0);
        if device_type == 0 {
            return Err(ServiceError::InvalidToken);
        }
        return Ok(Principal::Device(DevicePrincipal {
            client_id: text("/client_id"),
            device_type,
            classroom_id: text("/config/classroom/id"),
            classroom_title: text("/config/classroom/title"),
        }));
    }

    Err(ServiceError::InvalidToken)
}

/// HTTP implementation of both services.
pub struct HttpDirectory {
    client: reqwest::Client,
    settings: ServiceSettings,
}

impl std::fmt::Debug for HttpDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpDirectory")
            .field("api_domain", &self.settings.api_domain)
            .finish_non_exhaustive()
    }
}

impl HttpDirectory {
    pub fn new(settings: ServiceSettings) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .build()?;
        Ok(Self { client, settings })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.settings.api_domain.trim_end_matches('/'), path)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        token: &str,
    ) -> Result<T, ServiceError> {
        debug!(url, "directory request");
        let response = self
            .client
            .get(url)
            .query(&[("token", token)])
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<T>().await?)
    }

    async fn get_data<T: DeserializeOwned>(&self, url: &str) -> Result<T, ServiceError> {
        self.get_json::<ApiEnvelope<T>>(url, &self.settings.system_token)
            .await?
            .into_data()
    }
}

#[async_trait]
impl IdentityService for HttpDirectory {
    async fn resolve_token(&self, token: &str) -> Result<Principal, ServiceError> {
        let info: Value = self.get_json(&self.settings.tokeninfo_url, token).await?;
        principal_from_tokeninfo(info)
    }
}

#[async_trait]
impl UnitDirectory for HttpDirectory {
    async fn unit_info(&self, unit: &UnitId) -> Result<UnitInfo, ServiceError> {
        let url = self.api_url(&format!("/v1/units/{unit}/get"));
        match self.get_data::<UnitInfo>(&url).await {
            Err(ServiceError::Decode(_)) => Err(ServiceError::UnitNotFound(unit.to_string())),
            other => other,
        }
    }

    async fn unit_identity(&self, unit: &UnitId, uid: &str) -> Result<Identity, ServiceError> {
        let url = self.api_url(&format!("/v1/units/{unit}/users/{uid}/detail"));
        let data: UnitIdentityData = self.get_data(&url).await?;
        Ok(Identity::from_code_str(&data.identity))
    }

    async fn is_open_access(&self, unit: &UnitId) -> Result<bool, ServiceError> {
        let url = self.settings.unit_info_url.replace(":unit_id", unit.as_str());
        let unit_data: UnitCourseData = self.get_data(&url).await?;
        if unit_data.course_id.is_empty() {
            return Ok(false);
        }
        let url = self.api_url(&format!("/v1/courses/{}/detail", unit_data.course_id));
        let course: CourseData = self.get_data(&url).await?;
        Ok(course.public == "1" && course.premium == "1")
    }
}
