use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use paysign::config::{Environment, WechatConfig};
use paysign::signing::{MethodRegistry, SigningKey};
use paysign::transport::{ReqwestTransport, TransportOptions};
use paysign::{ParameterBag, RequestSigner, V3Client, pem};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "paysign", version, about = "Sign and verify payment-gateway requests")]
struct Cli {
    /// Log the library's signing strings and HTTP traces.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the canonical signing string of key=value pairs.
    Canonical {
        #[arg(value_name = "KEY=VALUE")]
        pairs: Vec<String>,
    },
    /// Sign a string with a registered method.
    Sign {
        #[arg(long, default_value = "RSA2")]
        method: String,
        #[command(flatten)]
        key: KeyArgs,
        #[arg(long)]
        input: String,
    },
    /// Check a signature. Exits non-zero when it does not verify.
    Verify {
        #[arg(long, default_value = "RSA2")]
        method: String,
        #[command(flatten)]
        key: KeyArgs,
        #[arg(long)]
        input: String,
        #[arg(long)]
        signature: String,
    },
    /// Print a WeChat Pay V3 Authorization header.
    Authorize {
        #[command(flatten)]
        wechat: WechatArgs,
        #[arg(long, default_value = "GET")]
        method: String,
        #[arg(long)]
        path: String,
        #[arg(long, default_value = "")]
        body: String,
    },
    /// Download and list the WeChat Pay platform certificates.
    Certs {
        #[command(flatten)]
        wechat: WechatArgs,
    },
    /// Print the Alipay SN of a certificate, or the root SN of a bundle.
    AlipaySn {
        #[arg(long)]
        cert: PathBuf,
        #[arg(long)]
        root: bool,
    },
}

#[derive(Args)]
struct KeyArgs {
    /// PEM private key for signing; public key or certificate for verifying.
    #[arg(long, env = "PAYSIGN_KEY", required_unless_present = "secret")]
    key: Option<PathBuf>,
    /// Shared secret for the HS* methods.
    #[arg(long, env = "PAYSIGN_HMAC_SECRET", hide_env_values = true)]
    secret: Option<String>,
}

#[derive(Args)]
struct WechatArgs {
    /// JSON file with the merchant configuration; replaces the flags below.
    #[arg(long, env = "WECHAT_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long, env = "WECHAT_MCH_ID")]
    mch_id: Option<String>,
    #[arg(long, env = "WECHAT_SERIAL_NO")]
    serial_no: Option<String>,
    #[arg(long, env = "WECHAT_PRIVATE_KEY")]
    private_key: Option<PathBuf>,
    #[arg(long, env = "WECHAT_API_V3_KEY", hide_env_values = true)]
    api_v3_key: Option<String>,
    #[arg(long, env = "WECHAT_BASE_URL")]
    base_url: Option<String>,
}

impl WechatArgs {
    fn load(self) -> Result<WechatConfig> {
        if let Some(path) = self.config {
            let text = read(&path)?;
            let config: WechatConfig = serde_json::from_str(&text)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            return Ok(config);
        }
        let private_key = match self.private_key {
            Some(path) => read(&path)?,
            None => String::new(),
        };
        Ok(WechatConfig {
            mch_id: self.mch_id.unwrap_or_default(),
            serial_no: self.serial_no.unwrap_or_default(),
            api_v3_key: self.api_v3_key.unwrap_or_default(),
            private_key,
            api_key: None,
            environment: Environment::Production,
            auto_verify: true,
            base_url: self.base_url,
            transport: TransportOptions::default(),
        })
    }
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("info,paysign=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_pairs(pairs: &[String]) -> Result<ParameterBag> {
    let mut bag = ParameterBag::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("expected KEY=VALUE, got {pair:?}");
        };
        bag.set(key, value);
    }
    Ok(bag)
}

fn signing_key(args: &KeyArgs) -> Result<SigningKey> {
    match (&args.secret, &args.key) {
        (Some(secret), _) => Ok(SigningKey::Hmac(secret.as_bytes().to_vec())),
        (None, Some(path)) => pem::decode_private_key(&read(path)?)
            .with_context(|| format!("failed to decode private key {}", path.display())),
        (None, None) => bail!("--key or --secret is required"),
    }
}

fn verifying_key(args: &KeyArgs) -> Result<paysign::VerifyingKey> {
    match (&args.secret, &args.key) {
        (Some(secret), _) => Ok(paysign::VerifyingKey::Hmac(secret.as_bytes().to_vec())),
        (None, Some(path)) => pem::decode_public_key(&read(path)?)
            .with_context(|| format!("failed to decode public key {}", path.display())),
        (None, None) => bail!("--key or --secret is required"),
    }
}

/// Cancels the token on Ctrl-C so in-flight downloads stop.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted");
            token.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    let registry = Arc::new(MethodRegistry::standard());

    match cli.command {
        Command::Canonical { pairs } => {
            println!("{}", parse_pairs(&pairs)?.canonical_string());
        }
        Command::Sign { method, key, input } => {
            let key = signing_key(&key)?;
            let signature = registry
                .sign(&method, &input, &key)
                .with_context(|| format!("failed to sign with {method}"))?;
            println!("{signature}");
        }
        Command::Verify {
            method,
            key,
            input,
            signature,
        } => {
            let key = verifying_key(&key)?;
            registry
                .verify(&method, &input, &signature, &key)
                .with_context(|| format!("{method} signature does not verify"))?;
            println!("ok");
        }
        Command::Authorize {
            wechat,
            method,
            path,
            body,
        } => {
            let config = wechat.load()?;
            let key = pem::decode_private_key(&config.private_key).context("failed to decode merchant key")?;
            let signer = RequestSigner::new(&config.mch_id, &config.serial_no, key, registry)?;
            println!("{}", signer.authorization(&method, &path, &body)?);
        }
        Command::Certs { wechat } => {
            let config = wechat.load()?;
            let transport = Arc::new(
                ReqwestTransport::new(&config.transport).context("failed to build HTTP client")?,
            );
            let client = V3Client::new(config, registry, transport).context("invalid WeChat configuration")?;
            let cancel = cancel_on_ctrl_c();
            let count = client
                .certificates()
                .refresh(&cancel)
                .await
                .context("failed to download platform certificates")?;
            debug!(count, "platform certificates downloaded");
            for serial in client.certificates().serials().await {
                println!("{serial}");
            }
            if let Some(newest) = client.certificates().newest().await {
                info!(serial = %newest.serial, not_after = ?newest.not_after, "newest certificate");
            }
        }
        Command::AlipaySn { cert, root } => {
            let text = read(&cert)?;
            let sn = if root {
                pem::alipay_root_cert_sn(&text)
            } else {
                pem::alipay_cert_sn(&text)
            }
            .with_context(|| format!("failed to read certificate {}", cert.display()))?;
            println!("{sn}");
        }
    }
    Ok(())
}
