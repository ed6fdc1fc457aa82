use std::path::PathBuf;

use clap::Parser;

/// Signs in to AWS through your identity provider's browser flow and
/// writes temporary credentials for the selected roles into
/// ~/.aws/credentials.
#[derive(Debug, Parser)]
#[command(name = "sso2aws", version, about)]
pub struct Args {
    /// URL that starts the single sign-on to AWS in the browser
    /// (or set SSO2AWS_URL)
    #[arg(short, long)]
    pub url: Option<String>,

    /// <profile name>:<role arn> - repeat for multiple profiles
    #[arg(short, long)]
    pub output: Vec<String>,

    /// Save all roles, using each role name as its profile name. Role
    /// names are not deduplicated
    #[arg(long, conflicts_with = "output")]
    pub all: bool,

    /// Just list the available roles and quit
    #[arg(long, conflicts_with_all = ["all", "output"])]
    pub list_roles: bool,

    /// Session duration in hours to request from STS
    #[arg(long, default_value_t = 1)]
    pub hours: i64,

    /// Region to direct the STS exchange at; defaults to the usual AWS
    /// environment variables, then the default profile of ~/.aws/config
    #[arg(short, long)]
    pub region: Option<String>,

    /// Chrome or Chromium binary to drive for the sign-in window
    /// (or set SSO2AWS_CHROME)
    #[arg(long)]
    pub browser: Option<PathBuf>,

    /// Verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
