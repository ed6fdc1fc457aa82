use std::error::Error;
use std::fmt::{self, Display, Formatter};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::trace;
use roxmltree::{Document, Node};

/// Attribute carrying the assumable roles inside an AWS SAML assertion.
pub const AWS_ROLE_ATTRIBUTE: &str = "https://aws.amazon.com/SAML/Attributes/Role";

/// One assumable role as advertised by the identity provider. The
/// attribute value encodes the pair as "<role arn>,<principal arn>".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Role {
    pub role_arn: String,
    pub principal_arn: String,
}

#[derive(Debug)]
pub enum SamlError {
    Decode(base64::DecodeError),
    Utf8(std::string::FromUtf8Error),
    Xml(roxmltree::Error),
    MalformedRole(String),
    NoRoles,
}

impl Display for SamlError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            SamlError::Decode(e) => write!(f, "could not decode assertion: {}", e),
            SamlError::Utf8(e) => write!(f, "assertion is not valid UTF-8: {}", e),
            SamlError::Xml(e) => write!(f, "could not parse assertion: {}", e),
            SamlError::MalformedRole(v) => write!(f, "malformed role attribute value: {}", v),
            SamlError::NoRoles => f.write_str("No roles found"),
        }
    }
}

impl Error for SamlError {}

/// Tag names are matched on the local part only, case-insensitively, so
/// that namespace prefixes (`saml2p:Response`, `SAML:Assertion`, ...) and
/// casing differences between providers never prevent the lookup.
fn is_tag(node: &Node, name: &str) -> bool {
    node.is_element() && node.tag_name().name().eq_ignore_ascii_case(name)
}

fn child<'a, 'd>(node: &Node<'a, 'd>, name: &str) -> Option<Node<'a, 'd>> {
    node.children().find(|n| is_tag(n, name))
}

/// Parses a base64-encoded SAML response and extracts the roles the user
/// is allowed to assume, in document order.
pub fn list_roles(assertion_b64: &str) -> Result<Vec<Role>, SamlError> {
    let xml = String::from_utf8(BASE64.decode(assertion_b64).map_err(SamlError::Decode)?)
        .map_err(SamlError::Utf8)?;

    trace!("list_roles.assertion={}", xml);

    let doc = Document::parse(&xml).map_err(SamlError::Xml)?;

    let root = doc.root_element();
    if !is_tag(&root, "response") {
        return Err(SamlError::NoRoles);
    }

    let role_attribute = child(&root, "assertion")
        .and_then(|assertion| child(&assertion, "attributestatement"))
        .ok_or(SamlError::NoRoles)?
        .children()
        .filter(|n| is_tag(n, "attribute"))
        .find(|n| n.attribute("Name") == Some(AWS_ROLE_ATTRIBUTE))
        .ok_or(SamlError::NoRoles)?;

    let mut roles = vec![];

    for value in role_attribute
        .children()
        .filter(|n| is_tag(n, "attributevalue"))
    {
        let text = value.text().unwrap_or("").trim();

        // first field is the role, second the principal; anything after a
        // second comma is ignored
        let mut fields = text.splitn(3, ',');

        match (fields.next(), fields.next()) {
            (Some(role_arn), Some(principal_arn)) => roles.push(Role {
                role_arn: role_arn.into(),
                principal_arn: principal_arn.into(),
            }),
            _ => return Err(SamlError::MalformedRole(text.into())),
        }
    }

    if roles.is_empty() {
        return Err(SamlError::NoRoles);
    }

    Ok(roles)
}
