//! sgx-hsm - provisioning tool for SGX-backed PKCS#11 tokens

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use colored::Colorize;
use sgx_hsm::{
    Config, CryptokiBackend, DEFAULT_LIBRARY_PATH, HsmError, QuoteEvidence, SgxContext,
    exponent_len, modulus_len, quote_offset,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_DEVICE_TIMEOUT_SECS: u64 = 30;

/// How long runtime shutdown waits for blocking device threads.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// PKCS#11 module to load
    #[arg(long, env = "SGX_PKCS11_LIBRARY", default_value = DEFAULT_LIBRARY_PATH)]
    library: String,

    /// JSON config file; flags and environment override its fields
    #[arg(long, env = "SGX_HSM_CONFIG")]
    config: Option<PathBuf>,

    /// Token label
    #[arg(long, env = "HSM_TOKEN_LABEL")]
    token_label: Option<String>,

    /// Normal user pin
    #[arg(long, env = "HSM_USER_PIN", hide_env_values = true)]
    user_pin: Option<String>,

    /// Security officer pin, used only when a token has to be initialized
    #[arg(long, env = "HSM_SO_PIN", hide_env_values = true)]
    so_pin: Option<String>,

    /// Label of the key to provision or sign with
    #[arg(long, env = "HSM_KEY_LABEL")]
    key_label: Option<String>,

    /// Key algorithm: rsa or ecdsa
    #[arg(long, env = "HSM_KEY_TYPE")]
    key_type: Option<String>,

    /// Seconds to wait for the device before giving up
    #[arg(long, default_value_t = DEFAULT_DEVICE_TIMEOUT_SECS)]
    device_timeout: u64,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open (and if needed initialize) the token, then report its state
    Status,

    /// Generate a persistent key pair on the token
    ProvisionKey {
        /// Key size in bits (RSA) or curve size (ECDSA)
        #[arg(long, default_value_t = 2048)]
        size: u32,
    },

    /// Self-sign a root CA certificate with a token key
    IssueCa {
        /// Where to write the DER certificate
        #[arg(long)]
        out: PathBuf,
    },

    /// Split an exported RSA public key parameter blob into key and quote
    QuoteOffsets {
        /// File holding the exported blob
        blob: PathBuf,

        /// Write the quote bytes to this file
        #[arg(long)]
        quote_out: Option<PathBuf>,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "sgx_hsm=info".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Config file (if any) with flag and environment overrides applied.
fn build_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(token_label) = &cli.token_label {
        config.token_label = token_label.clone();
    }
    if let Some(user_pin) = &cli.user_pin {
        config.user_pin = user_pin.clone();
    }
    if let Some(so_pin) = &cli.so_pin {
        config.so_pin = so_pin.clone();
    }
    if let Some(key_label) = &cli.key_label {
        config.key_label = key_label.clone();
    }
    if let Some(key_type) = &cli.key_type {
        config.key_type = key_type.clone();
    }

    Ok(config.validated())
}

/// Open a context on a blocking thread, run `f`, and tear the context down.
async fn with_context<T, F>(cli: &Cli, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&SgxContext<CryptokiBackend>) -> Result<T, HsmError> + Send + 'static,
{
    let library = cli.library.clone();
    let config = build_config(cli)?;

    let task = tokio::task::spawn_blocking(move || -> Result<T> {
        let backend = CryptokiBackend::new(&library)
            .with_context(|| format!("Failed to load PKCS#11 module {}", library))?;
        let context = SgxContext::new(backend, config).context("Failed to open SGX context")?;
        let result = f(&context);
        context.destroy();
        Ok(result?)
    });

    let timeout = Duration::from_secs(cli.device_timeout);
    tokio::time::timeout(timeout, task)
        .await
        .map_err(|_| anyhow!("Device did not respond within {}s", cli.device_timeout))?
        .context("Device task failed")?
}

async fn cmd_status(cli: &Cli) -> Result<()> {
    println!("{}", "Opening token...".green());

    let (label, state) = with_context(cli, |context| {
        Ok((context.token_label()?, context.state()?))
    })
    .await?;

    println!("{}", "Token ready".green().bold());
    println!("  Label: {}", label.cyan());
    println!("  State: {:?}", state);

    Ok(())
}

async fn cmd_provision_key(cli: &Cli, size: u32) -> Result<()> {
    let config = build_config(cli)?;
    let label = config.key_label_or_default().to_string();
    let algorithm = config.key_type.clone();

    println!(
        "{}",
        format!("Generating {} key '{}'...", algorithm, label).green()
    );

    let key_label = label.clone();
    with_context(cli, move |context| {
        context.initialize_key(&key_label, &algorithm, size)
    })
    .await
    .context("Key generation failed")?;

    println!("{}", "Key pair generated!".green().bold());
    println!("  Label: {}", label.cyan());

    Ok(())
}

async fn cmd_issue_ca(cli: &Cli, out: &Path) -> Result<()> {
    let label = build_config(cli)?.key_label_or_default().to_string();
    println!(
        "{}",
        format!("Issuing CA certificate with key '{}'...", label).green()
    );

    let key_label = label.clone();
    let (serial, der) = with_context(cli, move |context| {
        let certificate = context.issue_ca_certificate(&key_label)?;
        Ok((
            hex::encode(certificate.serial_number()),
            certificate.to_der().to_vec(),
        ))
    })
    .await
    .context("CA issuance failed")?;

    std::fs::write(out, &der)
        .with_context(|| format!("Failed to write certificate to {}", out.display()))?;

    println!("{}", "CA certificate issued!".green().bold());
    println!("  Serial: {}", serial.cyan());
    println!("  Output: {}", out.display());

    Ok(())
}

fn cmd_quote_offsets(blob_path: &Path, quote_out: Option<&Path>, json: bool) -> Result<()> {
    let blob = std::fs::read(blob_path)
        .with_context(|| format!("Failed to read {}", blob_path.display()))?;
    let evidence = QuoteEvidence::parse(&blob).context("Invalid parameter blob")?;

    if let Some(path) = quote_out {
        std::fs::write(path, &evidence.quote)
            .with_context(|| format!("Failed to write quote to {}", path.display()))?;
    }

    if json {
        let summary = serde_json::json!({
            "modulusLen": modulus_len(&blob),
            "exponentLen": exponent_len(&blob),
            "quoteOffset": quote_offset(&blob),
            "quoteLen": evidence.quote.len(),
            "exponent": hex::encode(&evidence.exponent),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("{}", "Parameter blob:".cyan().bold());
    println!("  Modulus:  {} bytes", modulus_len(&blob));
    println!("  Exponent: {} bytes ({})", exponent_len(&blob), hex::encode(&evidence.exponent));
    println!("  Quote:    {} bytes at offset {}", evidence.quote.len(), quote_offset(&blob));

    Ok(())
}

async fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Status => cmd_status(cli).await,
        Commands::ProvisionKey { size } => cmd_provision_key(cli, *size).await,
        Commands::IssueCa { out } => cmd_issue_ca(cli, out).await,
        Commands::QuoteOffsets {
            blob,
            quote_out,
            json,
        } => cmd_quote_offsets(blob, quote_out.as_deref(), *json),
    }
}

/// Drive `future` to completion, then shut the runtime down without waiting
/// on device threads that are still blocked after a timeout.
fn run_bounded<F: std::future::Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start runtime")?;
    let output = runtime.block_on(future);
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    Ok(output)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);
    tracing::debug!(library = %cli.library, "Starting sgx-hsm");

    run_bounded(run(&cli))?
}
