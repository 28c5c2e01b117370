use clap::Parser;

use crate::error::{self, ApiError};
use crate::http::{Headers, Method};
use crate::Result;

#[derive(Parser)]
#[command(
    name = "afetch",
    about = "HTTP client with response caching, request deduplication and retries"
)]
struct Args {
    /// Verbose mode. Logs requests, retries and cache activity to stderr
    #[clap(long, short, global = true)]
    pub verbose: bool,
    /// Client profile: fast, standard, slow or one defined in the config file
    #[clap(long, global = true, default_value = "standard")]
    pub profile: String,
    /// Path to the config file. Defaults to ~/.config/afetch/api
    #[clap(long, global = true)]
    pub config: Option<String>,
    /// JSON file holding stored auth tokens
    #[clap(long, global = true)]
    pub token_file: Option<String>,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Parser)]
enum Command {
    #[clap(about = "GET a resource. Repeated calls are served from the cache")]
    Get(ReadCommand),
    #[clap(about = "POST a JSON payload")]
    Post(WriteCommand),
    #[clap(about = "PUT a JSON payload")]
    Put(WriteCommand),
    #[clap(about = "PATCH a JSON payload")]
    Patch(WriteCommand),
    #[clap(about = "DELETE a resource")]
    Delete(ReadCommand),
}

#[derive(Parser)]
struct CommonArgs {
    /// Absolute URL or path relative to the profile base_url
    pub url: String,
    /// Extra header as 'name: value'. Can be repeated
    #[clap(short = 'H', long = "header")]
    pub headers: Vec<String>,
    /// Issue the same call this many times
    #[clap(long, default_value_t = 1)]
    pub repeat: u32,
    /// Print performance samples and a summary after the calls
    #[clap(long)]
    pub metrics: bool,
    /// Override the number of retries
    #[clap(long)]
    pub retries: Option<u32>,
}

#[derive(Parser)]
struct ReadCommand {
    #[clap(flatten)]
    pub common: CommonArgs,
    /// Bypass the response cache
    #[clap(long)]
    pub no_cache: bool,
}

#[derive(Parser)]
struct WriteCommand {
    #[clap(flatten)]
    pub common: CommonArgs,
    /// JSON request body
    #[clap(long, short)]
    pub data: Option<String>,
}

pub struct CliArgs {
    pub verbose: bool,
    pub profile: String,
    pub config_file: Option<String>,
    pub token_file: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RequestCommand {
    pub method: Method,
    pub url: String,
    pub headers: Headers,
    pub data: Option<serde_json::Value>,
    pub repeat: u32,
    pub metrics: bool,
    pub skip_cache: bool,
    pub retries: Option<u32>,
}

pub struct OptionArgs {
    pub cli_args: CliArgs,
    pub command: RequestCommand,
}

pub fn parse_cli() -> Result<OptionArgs> {
    Args::parse().try_into()
}

pub fn parse_cli_from<I, T>(args: I) -> Result<OptionArgs>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Args::try_parse_from(args)?.try_into()
}

fn parse_headers(raw: &[String]) -> Result<Headers> {
    let mut headers = Headers::new();
    for header in raw {
        let Some((name, value)) = header.split_once(':') else {
            return Err(error::gen(format!(
                "Invalid header '{header}', expected 'name: value'"
            )));
        };
        headers.set(name.trim(), value.trim());
    }
    Ok(headers)
}

impl RequestCommand {
    fn new(method: Method, common: CommonArgs) -> Result<Self> {
        Ok(RequestCommand {
            method,
            url: common.url,
            headers: parse_headers(&common.headers)?,
            data: None,
            repeat: common.repeat.max(1),
            metrics: common.metrics,
            skip_cache: false,
            retries: common.retries,
        })
    }

    fn read(method: Method, command: ReadCommand) -> Result<Self> {
        let mut request = RequestCommand::new(method, command.common)?;
        request.skip_cache = command.no_cache;
        Ok(request)
    }

    fn write(method: Method, command: WriteCommand) -> Result<Self> {
        let mut request = RequestCommand::new(method, command.common)?;
        request.data = match command.data {
            Some(data) => Some(serde_json::from_str(&data).map_err(|err| {
                ApiError::SerializationError(format!("--data is not valid JSON: {err}"))
            })?),
            None => None,
        };
        Ok(request)
    }
}

impl TryFrom<Args> for OptionArgs {
    type Error = crate::Error;

    fn try_from(args: Args) -> Result<Self> {
        let command = match args.command {
            Command::Get(command) => RequestCommand::read(Method::GET, command)?,
            Command::Delete(command) => RequestCommand::read(Method::DELETE, command)?,
            Command::Post(command) => RequestCommand::write(Method::POST, command)?,
            Command::Put(command) => RequestCommand::write(Method::PUT, command)?,
            Command::Patch(command) => RequestCommand::write(Method::PATCH, command)?,
        };
        Ok(OptionArgs {
            cli_args: CliArgs {
                verbose: args.verbose,
                profile: args.profile,
                config_file: args.config,
                token_file: args.token_file,
            },
            command,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_with_defaults() {
        let options = parse_cli_from(["afetch", "get", "/devices"]).unwrap();
        assert!(!options.cli_args.verbose);
        assert_eq!("standard", options.cli_args.profile);
        assert_eq!(Method::GET, options.command.method);
        assert_eq!("/devices", options.command.url);
        assert_eq!(1, options.command.repeat);
        assert!(!options.command.skip_cache);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let options = parse_cli_from([
            "afetch", "get", "/sites", "--no-cache", "-v", "--profile", "fast", "--repeat", "3",
            "--metrics",
        ])
        .unwrap();
        assert!(options.cli_args.verbose);
        assert_eq!("fast", options.cli_args.profile);
        assert!(options.command.skip_cache);
        assert!(options.command.metrics);
        assert_eq!(3, options.command.repeat);
    }

    #[test]
    fn test_post_with_data_and_headers() {
        let options = parse_cli_from([
            "afetch",
            "post",
            "https://api.airqo.net/api/v2/devices",
            "--data",
            r#"{"name":"aq_g5_01"}"#,
            "-H",
            "X-Tenant: airqo",
            "--header",
            "Authorization: JWT abc",
        ])
        .unwrap();
        assert_eq!(Method::POST, options.command.method);
        assert_eq!(Some(json!({"name": "aq_g5_01"})), options.command.data);
        assert_eq!("airqo", options.command.headers.get("x-tenant").unwrap());
        assert_eq!("JWT abc", options.command.headers.get("authorization").unwrap());
    }

    #[test]
    fn test_invalid_json_data_is_err() {
        assert!(parse_cli_from(["afetch", "put", "/devices/1", "--data", "{name"]).is_err());
    }

    #[test]
    fn test_invalid_header_is_err() {
        assert!(parse_cli_from(["afetch", "get", "/devices", "-H", "no-colon"]).is_err());
    }

    #[test]
    fn test_missing_subcommand_is_err() {
        assert!(parse_cli_from(["afetch"]).is_err());
    }
}
