use std::error::Error;
use std::fmt::{self, Display, Formatter};

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use log::{error, info};

use crate::aws::credentials::{CredentialsFile, CredentialsFileError};
use crate::aws::sts::{AssumeRoleWithSamlRequest, StsError, StsExchange};
use crate::saml::Role;

/// How many STS exchanges may be in flight at once. The rest of the
/// targets queue up behind these slots.
const MAX_IN_FLIGHT_EXCHANGES: usize = 5;

/// One desired credentials-file profile and the role it is populated from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTarget {
    pub profile: String,
    pub role_arn: String,
}

impl OutputTarget {
    /// Parses the `<profile>:<role arn>` form of the --output flag. Only
    /// the first colon separates; role ARNs contain colons of their own.
    pub fn parse(spec: &str) -> Result<Self, FetchError> {
        match spec.split_once(':') {
            Some((profile, role_arn)) if !profile.is_empty() && !role_arn.is_empty() => {
                Ok(OutputTarget {
                    profile: profile.into(),
                    role_arn: role_arn.into(),
                })
            }
            _ => Err(FetchError::InvalidOutputSpec(spec.into())),
        }
    }

    /// One target per discovered role, named after the path segment right
    /// after the first `/` of the role ARN. Role names are not deduplicated.
    pub fn for_all_roles(roles: &[Role]) -> Vec<Self> {
        roles
            .iter()
            .map(|role| {
                let name = role.role_arn.split('/').nth(1).unwrap_or(&role.role_arn);

                OutputTarget {
                    profile: name.into(),
                    role_arn: role.role_arn.clone(),
                }
            })
            .collect()
    }
}

#[derive(Debug)]
pub enum FetchError {
    InvalidOutputSpec(String),
    UnknownRole(String),
    Exchange(StsError),
    Persist(CredentialsFileError),
}

impl Display for FetchError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            FetchError::InvalidOutputSpec(spec) => {
                write!(f, "invalid output {:?}, expected <profile>:<role arn>", spec)
            }
            FetchError::UnknownRole(arn) => write!(f, "Cannot assume role {}", arn),
            FetchError::Exchange(e) => e.fmt(f),
            FetchError::Persist(e) => e.fmt(f),
        }
    }
}

impl Error for FetchError {}

/// What happened to a single output target.
#[derive(Debug)]
pub struct TargetOutcome {
    pub profile: String,
    pub role_arn: String,
    pub result: Result<Option<DateTime<Utc>>, FetchError>,
}

/// Exchanges the assertion once per requested target and persists each
/// success, with at most five exchanges in flight at a time.
///
/// Failures never cross target boundaries: an unmatched role ARN, a failed
/// exchange or a failed write is reported for its own profile and the
/// remaining targets keep going. The returned outcomes cover every target,
/// in completion order.
pub async fn obtain_all_credentials<S: StsExchange>(
    sts: &S,
    credentials_file: &CredentialsFile,
    roles: &[Role],
    outputs: &[OutputTarget],
    saml_response: &str,
    hours: i64,
) -> Vec<TargetOutcome> {
    stream::iter(outputs)
        .map(|target| fetch_one(sts, credentials_file, roles, saml_response, hours, target))
        .buffer_unordered(MAX_IN_FLIGHT_EXCHANGES)
        .collect()
        .await
}

async fn fetch_one<S: StsExchange>(
    sts: &S,
    credentials_file: &CredentialsFile,
    roles: &[Role],
    saml_response: &str,
    hours: i64,
    target: &OutputTarget,
) -> TargetOutcome {
    let result = async {
        let role = roles
            .iter()
            .find(|role| role.role_arn == target.role_arn)
            .ok_or_else(|| FetchError::UnknownRole(target.role_arn.clone()))?;

        let credentials = sts
            .assume_role_with_saml(&AssumeRoleWithSamlRequest {
                role_arn: role.role_arn.clone(),
                principal_arn: role.principal_arn.clone(),
                saml_assertion: saml_response.into(),
                duration_seconds: hours * 3600,
            })
            .await
            .map_err(FetchError::Exchange)?;

        credentials_file
            .save_profile(&target.profile, &credentials)
            .await
            .map_err(FetchError::Persist)?;

        Ok(credentials.expiration)
    }
    .await;

    match &result {
        Ok(_) => info!("Saved profile {}", target.profile),
        Err(e) => error!("{}: {}", target.profile, e),
    }

    TargetOutcome {
        profile: target.profile.clone(),
        role_arn: target.role_arn.clone(),
        result,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::aws::Credentials;
    use ini::Ini;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct FakeSts {
        calls: Mutex<Vec<AssumeRoleWithSamlRequest>>,
        fail_for_role: Option<String>,
    }

    impl FakeSts {
        fn new() -> Self {
            FakeSts {
                calls: Mutex::new(vec![]),
                fail_for_role: None,
            }
        }

        fn failing_for(role_arn: &str) -> Self {
            FakeSts {
                calls: Mutex::new(vec![]),
                fail_for_role: Some(role_arn.into()),
            }
        }
    }

    impl StsExchange for FakeSts {
        async fn assume_role_with_saml(
            &self,
            request: &AssumeRoleWithSamlRequest,
        ) -> Result<Credentials, StsError> {
            self.calls.lock().unwrap().push(request.clone());

            if self.fail_for_role.as_deref() == Some(&request.role_arn) {
                return Err(StsError::Api {
                    status: 403,
                    message: "AccessDenied".into(),
                });
            }

            Ok(Credentials {
                access_key_id: format!("key-for-{}", request.role_arn),
                secret_access_key: "secret".into(),
                session_token: "token".into(),
                expiration: None,
            })
        }
    }

    fn role(role_arn: &str, principal_arn: &str) -> Role {
        Role {
            role_arn: role_arn.into(),
            principal_arn: principal_arn.into(),
        }
    }

    fn target(profile: &str, role_arn: &str) -> OutputTarget {
        OutputTarget {
            profile: profile.into(),
            role_arn: role_arn.into(),
        }
    }

    #[tokio::test]
    async fn issues_one_exchange_and_saves_the_profile() {
        let dir = tempdir().unwrap();
        let file = CredentialsFile::new(dir.path().join("credentials"));
        let sts = FakeSts::new();

        let outcomes = obtain_all_credentials(
            &sts,
            &file,
            &[role("XXX", "YYY")],
            &[target("p", "XXX")],
            "SAML",
            1,
        )
        .await;

        let calls = sts.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            *calls,
            vec![AssumeRoleWithSamlRequest {
                role_arn: "XXX".into(),
                principal_arn: "YYY".into(),
                saml_assertion: "SAML".into(),
                duration_seconds: 3600,
            }]
        );

        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].result.is_ok());

        let store = Ini::load_from_file(file.path()).unwrap();
        let section = store.section(Some("p")).unwrap();
        assert_eq!(section.get("aws_access_key_id"), Some("key-for-XXX"));
        assert_eq!(section.get("aws_secret_access_key"), Some("secret"));
        assert_eq!(section.get("aws_session_token"), Some("token"));
    }

    #[tokio::test]
    async fn duration_scales_with_hours() {
        let dir = tempdir().unwrap();
        let file = CredentialsFile::new(dir.path().join("credentials"));
        let sts = FakeSts::new();

        obtain_all_credentials(
            &sts,
            &file,
            &[role("XXX", "YYY")],
            &[target("p", "XXX")],
            "SAML",
            8,
        )
        .await;

        assert_eq!(sts.calls.lock().unwrap()[0].duration_seconds, 28800);
    }

    #[tokio::test]
    async fn unmatched_role_does_not_abort_the_others() {
        let dir = tempdir().unwrap();
        let file = CredentialsFile::new(dir.path().join("credentials"));
        let sts = FakeSts::new();

        let outcomes = obtain_all_credentials(
            &sts,
            &file,
            &[role("XXX", "YYY"), role("AAA", "BBB")],
            &[target("p", "XXX"), target("p2", "NOPE")],
            "SAML",
            1,
        )
        .await;

        // exactly one exchange: the unmatched target never reaches STS
        assert_eq!(sts.calls.lock().unwrap().len(), 1);

        let failed = outcomes.iter().find(|o| o.profile == "p2").unwrap();
        assert!(matches!(
            failed.result,
            Err(FetchError::UnknownRole(ref arn)) if arn == "NOPE"
        ));

        let saved = outcomes.iter().find(|o| o.profile == "p").unwrap();
        assert!(saved.result.is_ok());

        let store = Ini::load_from_file(file.path()).unwrap();
        assert!(store.section(Some("p")).is_some());
        assert!(store.section(Some("p2")).is_none());
    }

    #[tokio::test]
    async fn exchange_failure_is_isolated_too() {
        let dir = tempdir().unwrap();
        let file = CredentialsFile::new(dir.path().join("credentials"));
        let sts = FakeSts::failing_for("AAA");

        let outcomes = obtain_all_credentials(
            &sts,
            &file,
            &[role("XXX", "YYY"), role("AAA", "BBB")],
            &[target("good", "XXX"), target("bad", "AAA")],
            "SAML",
            1,
        )
        .await;

        assert_eq!(outcomes.len(), 2);

        let bad = outcomes.iter().find(|o| o.profile == "bad").unwrap();
        assert!(matches!(bad.result, Err(FetchError::Exchange(_))));

        let store = Ini::load_from_file(file.path()).unwrap();
        assert!(store.section(Some("good")).is_some());
        assert!(store.section(Some("bad")).is_none());
    }

    #[test]
    fn output_spec_splits_on_the_first_colon_only() {
        let target = OutputTarget::parse("dev:arn:aws:iam::111:role/XXX").unwrap();

        assert_eq!(target.profile, "dev");
        assert_eq!(target.role_arn, "arn:aws:iam::111:role/XXX");
    }

    #[test]
    fn output_spec_without_a_colon_is_invalid() {
        assert!(matches!(
            OutputTarget::parse("just-a-profile").unwrap_err(),
            FetchError::InvalidOutputSpec(_)
        ));
        assert!(matches!(
            OutputTarget::parse(":arn").unwrap_err(),
            FetchError::InvalidOutputSpec(_)
        ));
    }

    #[test]
    fn all_roles_derive_their_profile_names() {
        let targets = OutputTarget::for_all_roles(&[
            role("arn:aws:iam::111:role/XXX", "p1"),
            role("arn:aws:iam::111:role/AAA", "p2"),
        ]);

        assert_eq!(
            targets,
            vec![
                target("XXX", "arn:aws:iam::111:role/XXX"),
                target("AAA", "arn:aws:iam::111:role/AAA"),
            ]
        );
    }

    #[test]
    fn arn_without_a_path_keeps_its_full_name() {
        let targets = OutputTarget::for_all_roles(&[role("slashless", "p")]);

        assert_eq!(targets[0].profile, "slashless");
    }
}
