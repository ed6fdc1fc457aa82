use std::env;
use std::error::Error;
use std::process::exit;

use clap::Parser;
use crossterm::style::Stylize;
use log::debug;

mod aws;
mod browser;
mod cli;
mod fetch;
mod saml;

use aws::credentials::CredentialsFile;
use aws::sts::StsClient;
use browser::chrome::ChromeBrowser;
use cli::Args;
use fetch::OutputTarget;

const ENV_START_URL: &str = "SSO2AWS_URL";

fn main() {
    openssl_probe::init_ssl_cert_env_vars();

    let args = Args::parse();

    if let Err(e) = setup_logger(args.verbose) {
        eprintln!("could not set up logging: {}", e);
        exit(1);
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("could not start the runtime: {}", e);
            exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(args)) {
        eprintln!("{} {}", "error:".red(), e);
        exit(1);
    }
}

/// Stderr logging so that --list-roles output on stdout stays pipeable.
fn setup_logger(verbosity: u8) -> Result<(), fern::InitError> {
    let level = match verbosity {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}] {}",
                chrono::Local::now().format("%H:%M:%S"),
                record.level(),
                message
            ))
        })
        .level(level)
        .level_for("tungstenite", log::LevelFilter::Info)
        .chain(std::io::stderr())
        .apply()?;

    Ok(())
}

async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let start_url = args
        .url
        .or_else(|| env::var(ENV_START_URL).ok())
        .ok_or("No URL specified")?;

    // stdout stays clean for --list-roles output
    eprintln!("Please complete the sign-in in the browser window.");

    let chrome = ChromeBrowser::new(args.browser);
    let saml_response = browser::obtain_saml(&chrome, &start_url).await?;
    let roles = saml::list_roles(&saml_response)?;

    debug!("discovered {} roles", roles.len());

    if args.list_roles {
        for role in &roles {
            println!("{}", role.role_arn);
        }
        return Ok(());
    }

    let outputs = if !args.output.is_empty() {
        args.output
            .iter()
            .map(|spec| OutputTarget::parse(spec))
            .collect::<Result<Vec<_>, _>>()?
    } else if args.all {
        OutputTarget::for_all_roles(&roles)
    } else {
        vec![]
    };

    if outputs.is_empty() {
        return Err("No outputs specified".into());
    }

    let region = args.region.or_else(aws::sts::default_region);
    debug!("sts region: {:?}", region);

    let sts = StsClient::new(region.as_deref())?;
    let credentials_file = CredentialsFile::default_location()?;

    let outcomes = fetch::obtain_all_credentials(
        &sts,
        &credentials_file,
        &roles,
        &outputs,
        &saml_response,
        args.hours,
    )
    .await;

    println!();
    for outcome in &outcomes {
        let profile = outcome.profile.as_str().yellow();

        match &outcome.result {
            Ok(Some(expiration)) => println!(
                "{}\t{} (expires {})",
                profile,
                "OK".green(),
                expiration.with_timezone(&chrono::Local)
            ),
            Ok(None) => println!("{}\t{}", profile, "OK".green()),
            Err(e) => println!("{}\t{} {}", profile, "FAIL".red(), e),
        }
    }

    Ok(())
}
