use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use axum::http::{header, HeaderName, HeaderValue, Method as HttpMethod};
use clap::{Args, Parser, Subcommand, ValueEnum};
use reqwest::blocking::Client as HttpClient;
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::auth::ApiKeyStore;
use crate::automation::http::HttpAutomation;
use crate::automation::mock::MockAutomation;
use crate::automation::ChatAutomation;
use crate::config::{RelayConfig, ResponseSource};
use crate::relay::Relay;
use crate::router::{
    build_router_with_state, AppState, AuthConfig, CancelResponse, ModelListResponse,
    QueueStatusResponse,
};
use crate::source::StreamQueue;

#[derive(Parser, Debug)]
#[command(name = "chat-relay", bin_name = "chat-relay")]
#[command(about = "OpenAI-compatible relay for a browser-automated chat session", version)]
#[command(arg_required_else_help = true)]
pub struct ChatRelayCli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, short = 't', global = true)]
    token: Option<String>,

    #[arg(long, short = 'n', global = true)]
    no_token: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay HTTP server.
    Server(ServerArgs),
    /// Inspect the request queue of a running server.
    Queue(QueueArgs),
    /// Cancel a queued request on a running server.
    Cancel(CancelArgs),
    /// List the models a running server offers.
    Models(ClientArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// `http` when a driver URL is configured, otherwise `mock`.
    Auto,
    /// In-process echo backend.
    Mock,
    /// External page-driver sidecar.
    Http,
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H')]
    host: Option<String>,

    #[arg(long, short = 'p')]
    port: Option<u16>,

    #[arg(long, value_enum, default_value_t = Backend::Auto)]
    backend: Backend,

    #[arg(long)]
    driver_url: Option<String>,

    #[arg(long)]
    response_source: Option<ResponseSource>,

    #[arg(long)]
    model_name: Option<String>,

    #[arg(long)]
    excluded_models: Option<PathBuf>,

    #[arg(long)]
    response_timeout_ms: Option<u64>,

    /// Key file for the token guard.
    #[arg(long)]
    api_key_file: Option<PathBuf>,

    /// Browser origin allowed to call the API. Repeatable.
    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    #[arg(long, short = 'e')]
    endpoint: Option<String>,
}

#[derive(Args, Debug)]
pub struct QueueArgs {
    #[command(subcommand)]
    command: QueueCommand,
}

#[derive(Subcommand, Debug)]
pub enum QueueCommand {
    /// Show queued requests and whether the page is busy.
    Status(ClientArgs),
}

#[derive(Args, Debug)]
pub struct CancelArgs {
    request_id: String,

    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(String),
    #[error("unexpected http status: {0}")]
    HttpStatus(reqwest::StatusCode),
}

pub struct CliConfig {
    pub token: Option<String>,
    pub no_token: bool,
}

pub fn run_chat_relay() -> Result<(), CliError> {
    let cli = ChatRelayCli::parse();
    let ChatRelayCli {
        command,
        token,
        no_token,
    } = cli;
    let config = CliConfig { token, no_token };
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    run_command(&command, &config)
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
    Ok(())
}

fn run_command(command: &Command, cli: &CliConfig) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server(cli, args),
        Command::Queue(args) => match &args.command {
            QueueCommand::Status(client) => {
                let ctx = ClientContext::new(cli, client)?;
                let response = ctx.get("/queue/status")?;
                print_json_response::<QueueStatusResponse>(response)
            }
        },
        Command::Cancel(args) => {
            let ctx = ClientContext::new(cli, &args.client)?;
            let response = ctx.post_empty(&format!("/cancel/{}", args.request_id))?;
            print_json_response::<CancelResponse>(response)
        }
        Command::Models(client) => {
            let ctx = ClientContext::new(cli, client)?;
            let response = ctx.get("/v1/models")?;
            print_json_response::<ModelListResponse>(response)
        }
    }
}

/// Defaults, then environment, then flags.
fn server_config(cli: &CliConfig, server: &ServerArgs) -> RelayConfig {
    let mut config = RelayConfig::from_env();
    if let Some(host) = &server.host {
        config.host = host.clone();
    }
    if let Some(port) = server.port {
        config.port = port;
    }
    if let Some(url) = &server.driver_url {
        config.driver_url = Some(url.clone());
    }
    if let Some(source) = server.response_source {
        config.response_source = source;
    }
    if let Some(name) = &server.model_name {
        config.model_name = name.clone();
    }
    if let Some(path) = &server.excluded_models {
        config.excluded_models_path = Some(path.clone());
    }
    if let Some(path) = &server.api_key_file {
        config.api_key_file = Some(path.clone());
    }
    if let Some(ms) = server.response_timeout_ms {
        config.response_timeout = std::time::Duration::from_millis(ms);
    }
    if cli.no_token {
        config.token = None;
    } else if let Some(token) = &cli.token {
        config.token = Some(token.clone());
    }
    config
}

fn build_automation(
    backend: Backend,
    config: &RelayConfig,
    stream_queue: &Arc<StreamQueue>,
) -> Result<Arc<dyn ChatAutomation>, CliError> {
    let backend = match backend {
        Backend::Auto if config.driver_url.is_some() => Backend::Http,
        Backend::Auto => Backend::Mock,
        other => other,
    };
    match backend {
        Backend::Http => {
            let url = config
                .driver_url
                .as_deref()
                .ok_or_else(|| CliError::Server("--driver-url is required for the http backend".to_string()))?;
            let automation =
                HttpAutomation::new(url).map_err(|err| CliError::Server(err.to_string()))?;
            tracing::info!(driver_url = %url, "using http page driver");
            Ok(Arc::new(automation))
        }
        Backend::Mock | Backend::Auto => {
            tracing::info!("using mock automation backend");
            let mock = match config.response_source {
                ResponseSource::AuxStream => MockAutomation::new().with_stream_queue(stream_queue.clone()),
                ResponseSource::Page => MockAutomation::new(),
            };
            Ok(Arc::new(mock))
        }
    }
}

fn run_server(cli: &CliConfig, server: &ServerArgs) -> Result<(), CliError> {
    let config = server_config(cli, server);
    let auth = build_auth(&config)?;
    let cors = build_cors_layer(&server.cors_allow_origin)?;
    let addr = format!("{}:{}", config.host, config.port);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let stream_queue = Arc::new(StreamQueue::new(config.stream_idle_timeout));
        let automation = build_automation(server.backend, &config, &stream_queue)?;
        let relay = Relay::builder(config, automation)
            .stream_queue(stream_queue)
            .start();
        let state = Arc::new(AppState::new(auth, relay.clone()));
        let (mut router, _state) = build_router_with_state(state);
        if let Some(cors) = cors {
            router = router.layer(cors);
        }

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "server listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutdown requested");
                relay.shutdown().await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

/// Keys from the key file plus the `--token` value, which is accepted but
/// never written to the file.
fn build_auth(config: &RelayConfig) -> Result<AuthConfig, CliError> {
    let store = match &config.api_key_file {
        Some(path) => ApiKeyStore::load(path.clone())?,
        None => ApiKeyStore::default(),
    };
    if let Some(token) = &config.token {
        store.remember(token.clone());
    }
    if store.is_enabled() {
        tracing::info!(keys = store.len(), "api key authentication enabled");
    }
    Ok(AuthConfig::with_store(store))
}

/// `None` when no origin is configured; the relay is then same-origin only.
fn build_cors_layer(origins: &[String]) -> Result<Option<CorsLayer>, CliError> {
    if origins.is_empty() {
        return Ok(None);
    }
    let origins = origins
        .iter()
        .map(|origin| {
            origin
                .parse::<HeaderValue>()
                .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([HttpMethod::GET, HttpMethod::POST, HttpMethod::DELETE])
            .allow_headers([
                header::AUTHORIZATION,
                header::CONTENT_TYPE,
                HeaderName::from_static("x-api-key"),
            ]),
    ))
}

struct ClientContext {
    endpoint: String,
    token: Option<String>,
    client: HttpClient,
}

impl ClientContext {
    fn new(cli: &CliConfig, args: &ClientArgs) -> Result<Self, CliError> {
        let defaults = RelayConfig::from_env();
        let endpoint = args
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", defaults.host, defaults.port));
        let token = if cli.no_token {
            None
        } else {
            cli.token.clone().or(defaults.token)
        };
        let client = HttpClient::builder().build()?;
        Ok(Self {
            endpoint,
            token,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint.trim_end_matches('/'), path)
    }

    fn request(&self, method: Method, path: &str) -> reqwest::blocking::RequestBuilder {
        let url = self.url(path);
        let mut builder = self.client.request(method, url);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    fn get(&self, path: &str) -> Result<reqwest::blocking::Response, CliError> {
        Ok(self.request(Method::GET, path).send()?)
    }

    fn post_empty(&self, path: &str) -> Result<reqwest::blocking::Response, CliError> {
        Ok(self.request(Method::POST, path).send()?)
    }
}

fn print_json_response<T: serde::de::DeserializeOwned + Serialize>(
    response: reqwest::blocking::Response,
) -> Result<(), CliError> {
    let status = response.status();
    let text = response.text()?;

    if !status.is_success() {
        print_error_body(&text)?;
        return Err(CliError::HttpStatus(status));
    }

    let parsed: T = serde_json::from_str(&text)?;
    let pretty = serde_json::to_string_pretty(&parsed)?;
    write_stdout_line(&pretty)?;
    Ok(())
}

fn print_error_body(text: &str) -> Result<(), CliError> {
    if let Ok(json) = serde_json::from_str::<Value>(text) {
        let pretty = serde_json::to_string_pretty(&json)?;
        write_stderr_line(&pretty)?;
    } else {
        write_stderr_line(text)?;
    }
    Ok(())
}

fn write_stdout_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stdout();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

fn write_stderr_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stderr();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}
