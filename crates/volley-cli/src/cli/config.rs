use anyhow::bail;
use clap::{ArgAction, Parser};
use core::{fmt, time::Duration};

/// Runtime configuration for the `volley` binary.
///
/// Every option can be given on the command line or through the environment
/// (a `.env` file in the working directory is loaded first).
#[derive(Parser, Debug, Clone)]
#[command(
    name = "volley",
    version,
    about = "Fetch URLs with bounded concurrency, preserving input order"
)]
pub struct CliArgs {
    /// Comma separated list of URLs to fetch.
    ///
    /// When empty, five `/delay` URLs on `BASE_URL` labelled A to E are
    /// fetched instead.
    ///
    /// Environment variable: `URLS`
    #[arg(long, env = "URLS", value_delimiter = ',')]
    pub urls: Vec<String>,

    /// Base of the fallback URLs, typically a local test server.
    ///
    /// Environment variable: `BASE_URL`
    #[arg(long, env = "BASE_URL", default_value_t = String::from("http://localhost:3000"))]
    pub base_url: String,

    /// Maximum number of requests in flight at once.
    ///
    /// Environment variable: `MAX_CONCURRENCY`
    #[arg(long, env = "MAX_CONCURRENCY", default_value_t = 2)]
    pub max_concurrency: usize,

    /// Per-request timeout in milliseconds. No timeout when unset.
    ///
    /// Environment variable: `TIMEOUT_MS`
    #[arg(long, env = "TIMEOUT_MS")]
    pub timeout_ms: Option<u64>,

    /// Cancel every outstanding request as soon as one fails.
    ///
    /// Environment variable: `FAIL_FAST`
    #[arg(long, env = "FAIL_FAST", default_value_t = true, action = ArgAction::Set)]
    pub fail_fast: bool,

    /// Treat non-2xx responses as failures.
    ///
    /// Environment variable: `ERROR_FOR_STATUS`
    #[arg(long, env = "ERROR_FOR_STATUS", default_value_t = false)]
    pub error_for_status: bool,
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub urls: Vec<String>,
    pub max_concurrency: usize,
    pub timeout: Option<Duration>,
    pub fail_fast: bool,
    pub error_for_status: bool,
}

/// Labels and delays of the URLs fetched when none were given.
const FALLBACK_PLAN: [(&str, u64); 5] = [("A", 300), ("B", 100), ("C", 200), ("D", 100), ("E", 300)];

fn fallback_urls(base_url: &str) -> Vec<String> {
    let base = base_url.trim_end_matches('/');
    FALLBACK_PLAN
        .iter()
        .map(|(label, ms)| format!("{base}/delay?ms={ms}&label={label}"))
        .collect()
}

impl TryFrom<CliArgs> for FetchConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.max_concurrency == 0 {
            bail!("MAX_CONCURRENCY must be greater than 0");
        }

        let timeout = match args.timeout_ms {
            Some(0) => bail!("TIMEOUT_MS must be greater than 0"),
            Some(ms) => Some(Duration::from_millis(ms)),
            None => None,
        };

        let urls: Vec<String> = args
            .urls
            .iter()
            .map(|url| url.trim())
            .filter(|url| !url.is_empty())
            .map(str::to_owned)
            .collect();

        let urls = if urls.is_empty() {
            if args.base_url.trim().is_empty() {
                bail!("BASE_URL must not be empty when no URLS are given");
            }
            fallback_urls(args.base_url.trim())
        } else {
            urls
        };

        Ok(Self {
            urls,
            max_concurrency: args.max_concurrency,
            timeout,
            fail_fast: args.fail_fast,
            error_for_status: args.error_for_status,
        })
    }
}

impl fmt::Display for FetchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "max_concurrency={} timeout={} fail_fast={} count={}",
            self.max_concurrency,
            self.timeout
                .map_or_else(|| "none".to_owned(), |t| format!("{}ms", t.as_millis())),
            self.fail_fast,
            self.urls.len()
        )
    }
}
