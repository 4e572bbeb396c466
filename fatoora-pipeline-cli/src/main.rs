use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fatoora_pipeline::{
    api::{ComplianceOnboarding, ZatcaClient},
    canon,
    config::{Config, Environment},
    csr::{CsrSubject, ToBase64String},
    invoice::{
        InvoiceKind, TenantId,
        sign::{
            CertificateDetails, parse_certificate_pem, parse_private_key_pem,
            verify_key_matches_certificate,
        },
    },
    policy::{Operation, ensure_allowed},
    store::{CertificateRecord, CertificateStore},
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;
use x509_cert::der::EncodePem;

#[derive(Parser)]
#[command(name = "fatoora-pipeline")]
#[command(about = "Operator CLI for the ZATCA signing and clearance pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an RSA key and a CSR from an authority `.properties` file.
    Csr {
        #[arg(long)]
        csr_config: PathBuf,
        #[arg(long, default_value = "sandbox")]
        environment: Environment,
        #[arg(long)]
        private_key: PathBuf,
        #[arg(long)]
        generated_csr: PathBuf,
        /// Write the CSR as PEM instead of base64 of the PEM.
        #[arg(long)]
        pem: bool,
    },
    /// Store a certificate and key for a tenant.
    UploadCert {
        #[arg(long)]
        store: PathBuf,
        #[arg(long)]
        tenant: TenantId,
        #[arg(long)]
        environment: Environment,
        #[arg(long)]
        cert: PathBuf,
        #[arg(long)]
        key: PathBuf,
    },
    /// Show the active certificate record of a tenant.
    ActiveCert {
        #[arg(long)]
        store: PathBuf,
        #[arg(long)]
        tenant: TenantId,
        #[arg(long)]
        environment: Environment,
    },
    /// Obtain a sandbox certificate through the compliance endpoint and store it.
    OnboardSandbox {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        tenant: TenantId,
        #[arg(long)]
        csr_config: PathBuf,
    },
    /// Print the digest of an XML document's canonical form.
    Hash {
        #[arg(long)]
        xml: PathBuf,
        #[arg(long)]
        base64: bool,
    },
    /// Check that a private key belongs to a certificate.
    VerifyKey {
        #[arg(long)]
        cert: PathBuf,
        #[arg(long)]
        key: PathBuf,
    },
    /// Evaluate whether an operation is allowed.
    Policy {
        #[arg(long)]
        environment: Environment,
        #[arg(long)]
        kind: InvoiceKind,
        #[arg(long)]
        operation: Operation,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fatoora_pipeline=debug"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Csr {
            csr_config,
            environment,
            private_key,
            generated_csr,
            pem,
        } => {
            let subject = CsrSubject::parse_csr_config(&csr_config)?;
            let (csr, key) = subject.generate_request(environment)?;
            let csr_text = if pem {
                csr.to_pem(LineEnding::LF).context("encode CSR")?
            } else {
                csr.to_pem_base64_string()?
            };
            let key_pem = key.to_pkcs8_pem(LineEnding::LF).context("encode key")?;
            write(&generated_csr, csr_text.as_bytes())?;
            write(&private_key, key_pem.as_bytes())?;
            info!(csr = %generated_csr.display(), key = %private_key.display(), "CSR generated");
        }
        Commands::UploadCert {
            store,
            tenant,
            environment,
            cert,
            key,
        } => {
            let store = CertificateStore::open(store)?;
            let record = store.upload(&tenant, environment, &read(&cert)?, &read(&key)?)?;
            print_record(&record);
        }
        Commands::ActiveCert {
            store,
            tenant,
            environment,
        } => {
            let store = CertificateStore::open(store)?;
            print_record(&store.get_active(&tenant, environment)?);
        }
        Commands::OnboardSandbox {
            config,
            tenant,
            csr_config,
        } => {
            let config = Config::load(&config)?;
            let store = CertificateStore::open(config.certificate_root())?;
            let client = ZatcaClient::new(config)?;
            let subject = CsrSubject::parse_csr_config(&csr_config)?;
            let (csr, key) = subject.generate_request(Environment::Sandbox)?;
            let record = store
                .submit_and_store(
                    &tenant,
                    Environment::Sandbox,
                    &csr,
                    &key,
                    &ComplianceOnboarding::new(&client),
                )
                .await?;
            print_record(&record);
        }
        Commands::Hash { xml, base64 } => {
            let text = std::fs::read_to_string(&xml)
                .with_context(|| format!("read {}", xml.display()))?;
            let digest = canon::document_digest(&text)?;
            if base64 {
                println!("{}", digest.to_base64());
            } else {
                println!("{}", digest.to_hex());
            }
        }
        Commands::VerifyKey { cert, key } => {
            let cert = parse_certificate_pem(&read_string(&cert)?)?;
            let key = parse_private_key_pem(&read_string(&key)?)?;
            verify_key_matches_certificate(&cert, &key)?;
            let details = CertificateDetails::from_certificate(&cert)?;
            println!("OK serial={} not_after={}", details.serial, details.not_after);
        }
        Commands::Policy {
            environment,
            kind,
            operation,
        } => {
            ensure_allowed(environment, kind, operation)?;
            println!("allowed");
        }
    }

    Ok(())
}

fn read(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("read {}", path.display()))
}

fn read_string(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
}

fn write(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes).with_context(|| format!("write {}", path.display()))
}

fn print_record(record: &CertificateRecord) {
    println!("id: {}", record.id());
    println!("tenant: {}", record.tenant());
    println!("environment: {}", record.environment());
    println!("serial: {}", record.serial());
    println!("issuer: {}", record.issuer());
    println!("not_after: {}", record.not_after());
    println!("status: {:?}", record.status());
    println!("source: {:?}", record.source());
}
