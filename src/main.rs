#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use clap::Parser;
use dotenv::dotenv;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use winrm::{
    Client, FAILURE_EXIT_CODE, Parameters, Result, RunResult, WinRmError, endpoint_from_env,
    powershell,
};

/// Run a command on a Windows host over WinRM.
///
/// The endpoint comes from `WINRM_HOST`, `WINRM_PORT`, `WINRM_HTTPS` and
/// the other `WINRM_*` variables, read from the environment or `.env`.
#[derive(Parser, Debug)]
#[command(name = "winrm")]
#[command(version)]
#[command(about = "Run a command on a Windows host over WinRM", long_about = None)]
struct Cli {
    /// Treat the command as a PowerShell script
    #[arg(long = "ps")]
    powershell: bool,

    /// Print stdout, stderr and the exit code as one JSON document
    #[arg(long)]
    json: bool,

    /// Forward local stdin to the remote command
    #[arg(long)]
    stdin: bool,

    /// User for basic authentication (ignored with a client certificate)
    #[arg(short, long, env = "WINRM_USER")]
    user: Option<String>,

    /// Password for basic authentication
    #[arg(long, env = "WINRM_PASSWORD", hide_env_values = true, default_value = "")]
    password: String,

    /// Command and its arguments
    #[arg(required = true, trailing_var_arg = true)]
    command: Vec<String>,
}

impl Cli {
    fn command_line(&self) -> String {
        self.command.join(" ")
    }
}

#[tokio::main]
async fn main() {
    dotenv().ok();

    // Remote stdout is passed through, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let code = match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Remote execution failed");
            FAILURE_EXIT_CODE
        }
    };
    std::process::exit(code);
}

fn client_from_env(cli: &Cli) -> Result<Client> {
    let endpoint = endpoint_from_env()?;
    let mut params = Parameters::from_env();

    let username = if endpoint.cert.is_some() {
        params = params.with_client_cert_auth();
        String::new()
    } else {
        cli.user
            .clone()
            .ok_or_else(|| WinRmError::Config("WINRM_USER is not set".to_string()))?
    };

    let client = Client::with_parameters(&endpoint, username, cli.password.clone(), params)?;
    info!(url = %client.url(), transport = client.transport_name(), "WinRM client ready");
    Ok(client)
}

async fn execute(cli: Cli) -> Result<i32> {
    let command = cli.command_line();
    if cli.powershell && powershell::encode(&command).is_none() {
        return Err(WinRmError::Encoding("script is empty".to_string()));
    }
    let client = client_from_env(&cli)?;

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, terminating remote command");
                token.cancel();
            }
        });
    }

    if cli.json {
        let (output, failure) = match run_buffered(&client, &token, &cli, &command).await? {
            Ok(output) => (output, None),
            Err(e) => (e.output, Some(e.error)),
        };
        let json = serde_json::to_string_pretty(&output)
            .map_err(|e| WinRmError::Encoding(format!("Failed to serialize output: {}", e)))?;
        println!("{}", json);
        return match failure {
            Some(e) => Err(e),
            None => Ok(output.exit_code),
        };
    }

    let command = if cli.powershell {
        powershell::encode(&command)
            .ok_or_else(|| WinRmError::Encoding("script is empty".to_string()))?
    } else {
        command
    };
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    let stdin = cli.stdin.then(tokio::io::stdin);

    client
        .run_with_input(&token, &command, &mut stdout, &mut stderr, stdin)
        .await
}

/// Run with buffered output. The outer error is a local stdin failure.
async fn run_buffered(
    client: &Client,
    token: &CancellationToken,
    cli: &Cli,
    command: &str,
) -> Result<RunResult> {
    let input = if cli.stdin {
        let mut input = String::new();
        tokio::io::stdin().read_to_string(&mut input).await?;
        Some(input)
    } else {
        None
    };

    let result = match (cli.powershell, input) {
        (true, Some(input)) => client.run_ps_with_string(token, command, &input).await,
        (true, None) => client.run_ps(token, command).await,
        (false, Some(input)) => client.run_with_string(token, command, &input).await,
        (false, None) => client.run_cmd(token, command).await,
    };
    Ok(result)
}
