use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use clap::Parser;
use httpx::{Client, ClientConfig, Context, Request, Response};
use log::debug;
use reqwest::Method;

/// httpx - resilient HTTP requests from the command line
///
/// Retryable responses (429, 502, 503, ...) are retried with jittered
/// backoff that honors Retry-After. Retries are rate limited.
///
/// Examples:
///   httpx get https://example.com/api/items
///   httpx post https://example.com/api/items --data '{"name":"x"}'
#[derive(Parser, Debug)]
#[command(author, version = httpx::VERSION, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON client configuration file
    #[arg(long, env = "HTTPX_CONFIG", value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Total attempts per request
    #[arg(long, env = "HTTPX_MAX_RETRIES", value_name = "N", global = true)]
    max_retries: Option<usize>,

    /// Overall transport timeout in milliseconds
    #[arg(long, env = "HTTPX_TIMEOUT_MS", value_name = "MS", global = true)]
    timeout_ms: Option<u64>,

    /// Lower bound of the backoff between attempts in milliseconds
    #[arg(long, env = "HTTPX_MIN_RETRY_DELAY_MS", value_name = "MS", global = true)]
    min_retry_delay_ms: Option<u64>,

    /// Upper bound of the backoff between attempts in milliseconds
    #[arg(long, env = "HTTPX_MAX_RETRY_DELAY_MS", value_name = "MS", global = true)]
    max_retry_delay_ms: Option<u64>,

    /// Retries allowed per second
    #[arg(long, env = "HTTPX_RPS", value_name = "RATE", global = true)]
    rps: Option<f64>,

    /// Do not rate limit retries
    #[arg(long, global = true, conflicts_with = "rps")]
    no_rate_limit: bool,

    /// Disable the response cache even if the configuration enables it
    #[arg(long, global = true)]
    no_cache: bool,

    /// User-Agent header to send instead of the default one
    #[arg(long, short = 'A', env = "HTTPX_USER_AGENT", global = true)]
    user_agent: Option<String>,

    /// Extra request header, e.g. "Accept: application/json"
    #[arg(long = "header", short = 'H', value_name = "NAME: VALUE", global = true)]
    headers: Vec<String>,

    /// Print response headers
    #[arg(long, short = 'i', global = true)]
    include: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Send a GET request
    Get(UrlArgs),

    /// Send a HEAD request
    Head(UrlArgs),

    /// Send a POST request
    Post(PostArgs),
}

#[derive(clap::Args, Debug)]
struct UrlArgs {
    #[arg(value_name = "URL")]
    url: String,
}

#[derive(clap::Args, Debug)]
struct PostArgs {
    #[arg(value_name = "URL")]
    url: String,

    /// Request body
    #[arg(long, short = 'd', default_value = "")]
    data: String,

    #[arg(long, default_value = "application/json")]
    content_type: String,
}

impl Cli {
    /// Loads the configuration file, if any, and applies flag overrides.
    fn client_config(&self) -> Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => ClientConfig::default(),
        };

        if let Some(max_retries) = self.max_retries {
            config.max_retries = max_retries;
        }
        if let Some(ms) = self.timeout_ms {
            config.timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.min_retry_delay_ms {
            config.min_retry_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.max_retry_delay_ms {
            config.max_retry_delay = Duration::from_millis(ms);
        }
        if let Some(rps) = self.rps {
            let burst = config.rate_limit.as_ref().map_or(1, |r| r.burst);
            config.rate_limit = Some(httpx::config::RateLimitConfig {
                requests_per_second: rps,
                burst,
            });
        }
        if self.no_rate_limit {
            config.rate_limit = None;
        }
        if self.no_cache {
            config.cache.enabled = false;
        }

        config.validate().context("Invalid client configuration")?;
        Ok(config)
    }

    fn request(&self) -> Result<Request> {
        let mut request = match &self.command {
            Commands::Get(args) => Request::new(Method::GET, &args.url)?,
            Commands::Head(args) => Request::new(Method::HEAD, &args.url)?,
            Commands::Post(args) => Request::new(Method::POST, &args.url)?
                .with_header("Content-Type", &args.content_type)?
                .with_body(args.data.clone()),
        };

        for header in &self.headers {
            let Some((name, value)) = header.split_once(':') else {
                bail!("Invalid header {:?}, expected \"NAME: VALUE\"", header);
            };
            request.set_header(name.trim(), value.trim())?;
        }
        if let Some(user_agent) = &self.user_agent {
            request.set_user_agent(user_agent)?;
        }
        Ok(request)
    }
}

fn print_response(response: &Response, include_headers: bool) {
    println!("{}", response.status);
    if include_headers {
        for (name, value) in &response.headers {
            println!("{}: {}", name, value.to_str().unwrap_or("<binary>"));
        }
        println!();
    }
    if !response.body.is_empty() {
        println!("{}", response.text());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.debug { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = cli.client_config()?;
    debug!("Client configuration: {:?}", config);
    let request = cli.request()?;

    let client: Client = config.into_builder()?.try_build()?;

    let ctx = Context::background();
    let canceler = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            canceler.cancel();
        }
    });

    let url = request.url.clone();
    let response = client
        .execute(&ctx, request)
        .await
        .with_context(|| format!("Request to {} failed", url))?;

    print_response(&response, cli.include);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_get_parsing() {
        let cli = Cli::try_parse_from(["httpx", "get", "https://example.com"]).unwrap();
        match &cli.command {
            Commands::Get(args) => assert_eq!(args.url, "https://example.com"),
            _ => panic!("Expected Get command"),
        }
        assert_eq!(cli.max_retries, None);
        assert!(!cli.debug);
    }

    #[test]
    fn test_cli_post_parsing() {
        let cli = Cli::try_parse_from([
            "httpx",
            "post",
            "https://example.com/items",
            "--data",
            "a=1",
            "--content-type",
            "application/x-www-form-urlencoded",
        ])
        .unwrap();

        let request = cli.request().unwrap();
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.body.as_deref(), Some(&b"a=1"[..]));
        assert_eq!(
            request.headers.get("content-type").unwrap(),
            "application/x-www-form-urlencoded"
        );
    }

    #[test]
    fn test_cli_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "httpx",
            "get",
            "https://example.com",
            "--max-retries",
            "2",
            "--min-retry-delay-ms",
            "10",
            "--max-retry-delay-ms",
            "20",
            "--no-rate-limit",
        ])
        .unwrap();

        let config = cli.client_config().unwrap();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.min_retry_delay, Duration::from_millis(10));
        assert_eq!(config.max_retry_delay, Duration::from_millis(20));
        assert_eq!(config.rate_limit, None);
    }

    #[test]
    fn test_cli_rps_override_keeps_burst() {
        let cli = Cli::try_parse_from(["httpx", "--rps", "5", "head", "https://example.com"])
            .unwrap();
        let config = cli.client_config().unwrap();
        let rate_limit = config.rate_limit.unwrap();
        assert_eq!(rate_limit.requests_per_second, 5.0);
        assert_eq!(rate_limit.burst, 1);
    }

    #[test]
    fn test_cli_inverted_delays_rejected() {
        let cli = Cli::try_parse_from([
            "httpx",
            "get",
            "https://example.com",
            "--min-retry-delay-ms",
            "500",
            "--max-retry-delay-ms",
            "100",
        ])
        .unwrap();
        assert!(cli.client_config().is_err());
    }

    #[test]
    fn test_cli_headers() {
        let cli = Cli::try_parse_from([
            "httpx",
            "get",
            "https://example.com",
            "-H",
            "Accept: application/json",
            "--user-agent",
            "probe/1.0",
        ])
        .unwrap();
        let request = cli.request().unwrap();
        assert_eq!(request.headers.get("accept").unwrap(), "application/json");
        assert_eq!(request.headers.get("user-agent").unwrap(), "probe/1.0");
    }

    #[test]
    fn test_cli_malformed_header_rejected() {
        let cli =
            Cli::try_parse_from(["httpx", "get", "https://example.com", "-H", "Accept"]).unwrap();
        assert!(cli.request().is_err());
    }

    #[test]
    fn test_cli_no_subcommand_fails() {
        assert!(Cli::try_parse_from(["httpx", "https://example.com"]).is_err());
    }
}
