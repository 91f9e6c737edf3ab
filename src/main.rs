use std::path::Path;

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use http::StatusCode;
use keel::{
    HandlerRegistry, Server,
    config::{ServerConfig, ServerConfigValidator, loader::load_config},
    core::handler_fn,
    tracing_setup,
};
use serde_json::json;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "keel.yaml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "keel.yaml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "keel.yaml")]
        config: String,
    },
    /// Print the finalized route table
    Routes {
        /// Configuration file to use
        #[clap(short, long, default_value = "keel.yaml")]
        config: String,
    },
    /// Start the server (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "keel.yaml")]
        config: String,
    },
}

/// Handlers that route manifests can name out of the box.
fn builtin_handlers() -> HandlerRegistry {
    HandlerRegistry::new()
        .with(
            "health",
            handler_fn(|_req, res| {
                res.json(StatusCode::OK, &json!({ "status": "ok" }))?;
                Ok(())
            }),
        )
        .with(
            "echo",
            handler_fn(|req, res| {
                let body = json!({
                    "method": req.method().as_str(),
                    "path": req.path(),
                    "params": req.params(),
                    "query": req.query(),
                    "payload": req.payload().to_value(),
                    "principal": req.auth().principal,
                });
                res.json(StatusCode::OK, &body)?;
                Ok(())
            }),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Routes { config }) => routes_command(&config).await,
        Some(Commands::Serve { config }) => serve_command(&config).await,
        None => serve_command(&args.config).await,
    }
}

async fn serve_command(config_path: &str) -> Result<()> {
    let provider = rustls::crypto::aws_lc_rs::default_provider();
    let crypto_result = rustls::crypto::CryptoProvider::install_default(provider);

    let config: ServerConfig = load_config(config_path)
        .await
        .with_context(|| format!("Failed to load config from {config_path}"))?;

    tracing_setup::init_from_config(&config.logging)
        .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;

    if let Err(e) = crypto_result {
        tracing::warn!(
            "CryptoProvider::install_default for aws-lc-rs reported an error: {:?}. \
            This can happen if a provider was already installed.",
            e
        );
    }

    tracing::info!("Loaded configuration from {config_path}");

    let server = Server::builder(config)
        .handlers(builtin_handlers())
        .build()
        .context("Failed to build server")?;

    let report = server.run_until_signal().await?;
    if !report.drained {
        tracing::warn!(
            "{} requests were still in flight when the grace period ended",
            report.residual_requests
        );
    }
    for error in &report.provider_errors {
        tracing::error!("Provider teardown error: {}", error);
    }
    tracing::info!("Server stopped");
    Ok(())
}

async fn routes_command(config_path: &str) -> Result<()> {
    let config = load_config(config_path)
        .await
        .with_context(|| format!("Failed to load config from {config_path}"))?;
    let server = Server::builder(config)
        .handlers(builtin_handlers())
        .build()
        .context("Failed to build server")?;

    let table = server.dispatcher().route_table();
    println!("📋 {} route table entries (matched top to bottom):", table.len());
    for entry in table.entries() {
        let marker = if entry.is_catch_all() { " (catch-all)" } else { "" };
        println!(
            "   • {:<12} {}{}",
            entry.method_keys().join(","),
            entry.pattern(),
            marker
        );
    }
    Ok(())
}

async fn validate_config_command(config_path: &str) -> Result<()> {
    use keel::config::loader::load_config_unchecked;

    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config_unchecked(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match ServerConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Listen Address: {}", config.listen_addr);
            println!("   • Routers: {}", config.routers.len());
            println!("   • TLS Enabled: {}", config.tls.is_some());
            println!("   • Trailing Slash: {:?}", config.trailing_slash);
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Verify listen address format (e.g., '127.0.0.1:3000')");
            println!("   • Check that router directories exist");
            println!("   • Use durations with units for shutdown timeouts (e.g., '10s')");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# Keel server configuration

# The address to listen on
listen_addr: "127.0.0.1:8080"

# Paths ending in "/" are redirected (redirect), routed without the slash
# (rewrite) or routed as given (ignore)
trailing_slash: redirect

shutdown:
  request_grace_period: "10s"
  socket_close_timeout: "5s"

payload:
  max_bytes: 1048576
  max_files: 10
  max_file_bytes: 1048576

logging:
  level: info
  format: pretty

# Routers whose routes are read from manifest files. Handlers are named in
# the manifests; the binary ships "health" and "echo".
routers:
  - name: api
    base_path: /api
    directories:
      - ./routes
    not_found_fallback: true

# Serve over TLS:
# tls:
#   cert_path: ./certs/cert.pem
#   key_path: ./certs/key.pem
"#;

    tokio::fs::write(path, default_config)
        .await
        .with_context(|| format!("Failed to write {config_path}"))?;

    let routes_dir = path.parent().unwrap_or(Path::new(".")).join("routes");
    if !routes_dir.exists() {
        tokio::fs::create_dir_all(&routes_dir)
            .await
            .with_context(|| format!("Failed to create {}", routes_dir.display()))?;
        let manifest = r#"routes:
  - path: /health
    exclude_name: true
    handler: health
  - method: [GET, POST]
    path: /echo/{rest:.*}
    exclude_name: true
    handler: echo
"#;
        tokio::fs::write(routes_dir.join("default.yaml"), manifest)
            .await
            .context("Failed to write example route manifest")?;
    }

    println!("✅ Created configuration file: {config_path}");
    println!("💡 Start the server with: keel serve --config {config_path}");
    Ok(())
}
