use std::error::Error;
use std::fmt::{self, Display, Formatter};

use log::trace;
use url::form_urlencoded;

pub mod chrome;

/// Endpoint the identity provider posts the final SAML response to. The
/// request targeting it is the terminal step of the sign-on flow.
pub const AWS_SAML_ENDPOINT: &str = "https://signin.aws.amazon.com/saml";

#[derive(Debug)]
pub struct BrowserError {
    description: String,

    pub kind: BrowserErrorKind,
}

#[derive(Debug, PartialEq, Eq)]
pub enum BrowserErrorKind {
    /// No usable browser binary, or it refused to start.
    Launch,
    /// The DevTools conversation went wrong.
    Protocol,
    /// The window was closed before the sign-on completed.
    Cancelled,
    /// The intercepted request had no decodable SAML payload.
    Decode,
}

impl BrowserError {
    pub fn new(kind: BrowserErrorKind, message: &str) -> Self {
        BrowserError {
            description: message.into(),
            kind,
        }
    }
}

impl Display for BrowserError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(&self.description)
    }
}

impl Error for BrowserError {}

/// A navigable browsing surface that can observe its own outgoing
/// requests. The embedding shell owns window chrome, navigation and the
/// human-paced login; the pipeline only ever sees the captured body.
#[allow(async_fn_in_trait)]
pub trait BrowsingSurface {
    /// Opens a window at `start_url` and resolves with the raw upload body
    /// of the first outgoing request whose URL matches `target_url`. The
    /// matched request must be suppressed rather than forwarded, and the
    /// window disposed of afterwards regardless of outcome. There is no
    /// timeout: the human finishes the login at their own pace.
    async fn capture_request_body(
        &self,
        start_url: &str,
        target_url: &str,
    ) -> Result<Vec<u8>, BrowserError>;
}

/// Pops up a sign-in window at `start_url` and captures the SAMLResponse
/// field of the form posted to the AWS SAML endpoint.
pub async fn obtain_saml<B: BrowsingSurface>(
    browser: &B,
    start_url: &str,
) -> Result<String, BrowserError> {
    let body = browser
        .capture_request_body(start_url, AWS_SAML_ENDPOINT)
        .await?;

    trace!("obtain_saml.captured {} bytes", body.len());

    extract_form_field(&body, "SAMLResponse")
}

/// Decodes a URL-encoded form body and pulls out a single field.
fn extract_form_field(body: &[u8], field: &str) -> Result<String, BrowserError> {
    form_urlencoded::parse(body)
        .find(|(name, _)| name == field)
        .map(|(_, value)| value.into_owned())
        .ok_or_else(|| {
            BrowserError::new(
                BrowserErrorKind::Decode,
                &format!("request body carried no {} field", field),
            )
        })
}
