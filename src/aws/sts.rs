use std::env;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use ini::Ini;
use log::{debug, trace};
use serde_derive::Deserialize;

use super::Credentials;

const STS_API_VERSION: &str = "2011-06-15";

/// Connect and request timeout for the exchange, in milliseconds. A timed
/// out exchange is an ordinary per-target failure upstream.
const STS_TIMEOUT_MS: u64 = 5000;

#[derive(Debug)]
pub enum StsError {
    Http(reqwest::Error),
    Api { status: u16, message: String },
}

impl Display for StsError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            StsError::Http(e) => write!(f, "STS request failed: {}", e),
            StsError::Api { status, message } => {
                write!(f, "STS returned HTTP {}: {}", status, message)
            }
        }
    }
}

impl Error for StsError {}

impl From<reqwest::Error> for StsError {
    fn from(e: reqwest::Error) -> Self {
        StsError::Http(e)
    }
}

/// One AssumeRoleWithSAML exchange. The assertion is passed through exactly
/// as captured from the login flow, still base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssumeRoleWithSamlRequest {
    pub role_arn: String,
    pub principal_arn: String,
    pub saml_assertion: String,
    pub duration_seconds: i64,
}

/// Capability that turns a SAML assertion plus role identifiers into
/// temporary keys. The orchestrator only knows this seam.
#[allow(async_fn_in_trait)]
pub trait StsExchange {
    async fn assume_role_with_saml(
        &self,
        request: &AssumeRoleWithSamlRequest,
    ) -> Result<Credentials, StsError>;
}

#[derive(Deserialize)]
struct ResponseWrapper {
    #[serde(rename = "AssumeRoleWithSAMLResponse")]
    response: Response,
}

#[derive(Deserialize)]
struct Response {
    #[serde(rename = "AssumeRoleWithSAMLResult")]
    result: ResponseResult,
}

#[derive(Deserialize)]
struct ResponseResult {
    #[serde(rename = "Credentials")]
    credentials: RawCredentials,
}

#[derive(Deserialize)]
struct RawCredentials {
    #[serde(rename = "AccessKeyId")]
    access_key_id: String,
    #[serde(rename = "SecretAccessKey")]
    secret_access_key: String,
    #[serde(rename = "SessionToken")]
    session_token: String,
    #[serde(rename = "Expiration")]
    expiration: Option<f64>,
}

/// STS over the plain query API. `Accept: application/json` spares us the
/// XML envelope of the default response format.
pub struct StsClient {
    http: reqwest::Client,
    endpoint: String,
}

impl StsClient {
    pub fn new(region: Option<&str>) -> Result<Self, StsError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(STS_TIMEOUT_MS))
            .timeout(Duration::from_millis(STS_TIMEOUT_MS))
            .build()?;

        Ok(StsClient {
            http,
            endpoint: endpoint_for(region),
        })
    }
}

fn endpoint_for(region: Option<&str>) -> String {
    match region {
        Some(region) if region.starts_with("cn-") => {
            format!("https://sts.{}.amazonaws.com.cn", region)
        }
        Some(region) => format!("https://sts.{}.amazonaws.com", region),
        None => "https://sts.amazonaws.com".into(),
    }
}

impl StsExchange for StsClient {
    async fn assume_role_with_saml(
        &self,
        request: &AssumeRoleWithSamlRequest,
    ) -> Result<Credentials, StsError> {
        trace!(
            "assume_role_with_saml.role={} principal={} duration={}",
            request.role_arn,
            request.principal_arn,
            request.duration_seconds
        );

        let duration = request.duration_seconds.to_string();
        let params = [
            ("Action", "AssumeRoleWithSAML"),
            ("Version", STS_API_VERSION),
            ("RoleArn", &request.role_arn),
            ("PrincipalArn", &request.principal_arn),
            ("SAMLAssertion", &request.saml_assertion),
            ("DurationSeconds", &duration),
        ];

        let response = self
            .http
            .post(&self.endpoint)
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(StsError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let wrapper: ResponseWrapper = response.json().await?;
        let raw = wrapper.response.result.credentials;

        Ok(Credentials {
            access_key_id: raw.access_key_id,
            secret_access_key: raw.secret_access_key,
            session_token: raw.session_token,
            expiration: raw.expiration.and_then(parse_expiration),
        })
    }
}

fn parse_expiration(epoch_seconds: f64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(epoch_seconds as i64, 0).single()
}

/// Region to use when none was given on the command line: the usual AWS
/// environment variables first, then the default profile of
/// `$HOME/.aws/config`. `None` leaves the choice to the STS client, which
/// falls back to the global endpoint.
pub fn default_region() -> Option<String> {
    region_from_env().or_else(|| {
        let config = dirs::home_dir()?.join(".aws").join("config");
        region_from_config(&config)
    })
}

fn region_from_env() -> Option<String> {
    ["AWS_REGION", "AWS_DEFAULT_REGION"]
        .iter()
        .find_map(|name| env::var(name).ok().filter(|v| !v.is_empty()))
}

fn region_from_config(path: &Path) -> Option<String> {
    let config = Ini::load_from_file(path).ok()?;
    let region = config.get_from(Some("default"), "region").map(String::from);

    debug!(
        "region_from_config.path={} region={:?}",
        path.display(),
        region
    );

    region
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Datelike;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn picks_the_regional_endpoint() {
        assert_eq!(
            endpoint_for(Some("eu-central-1")),
            "https://sts.eu-central-1.amazonaws.com"
        );
        assert_eq!(
            endpoint_for(Some("cn-northwest-1")),
            "https://sts.cn-northwest-1.amazonaws.com.cn"
        );
        assert_eq!(endpoint_for(None), "https://sts.amazonaws.com");
    }

    #[test]
    fn deserializes_the_json_response() {
        let body = r#"{
            "AssumeRoleWithSAMLResponse": {
                "AssumeRoleWithSAMLResult": {
                    "Audience": "https://signin.aws.amazon.com/saml",
                    "Credentials": {
                        "AccessKeyId": "ASIAKEY",
                        "SecretAccessKey": "secret",
                        "SessionToken": "token",
                        "Expiration": 1700000000.0
                    }
                },
                "ResponseMetadata": { "RequestId": "0000" }
            }
        }"#;

        let wrapper: ResponseWrapper = serde_json::from_str(body).unwrap();
        let raw = wrapper.response.result.credentials;

        assert_eq!(raw.access_key_id, "ASIAKEY");
        assert_eq!(raw.secret_access_key, "secret");
        assert_eq!(raw.session_token, "token");

        let expiration = parse_expiration(raw.expiration.unwrap()).unwrap();
        assert_eq!(expiration.year(), 2023);
    }

    #[test]
    fn reads_the_region_of_the_default_profile() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config");
        fs::write(&path, "[default]\nregion=eu-west-1\noutput=json\n").unwrap();

        assert_eq!(region_from_config(&path), Some("eu-west-1".into()));
    }

    #[test]
    fn missing_config_means_no_region() {
        let dir = tempdir().unwrap();

        assert_eq!(region_from_config(&dir.path().join("config")), None);
    }
}
