use std::path::PathBuf;
use std::sync::Arc;

use afetch::{
    api_defaults::AUTH_TOKEN_KEY,
    cli::{parse_cli, OptionArgs},
    cmds,
    config::Config,
    session::{FileTokenStore, MemoryNavigator, MemoryTokenStore, Session, TokenStore},
    ApiClient, Result,
};
use env_logger::Env;

fn main() -> Result<()> {
    let OptionArgs { cli_args, command } = parse_cli()?;
    if cli_args.verbose {
        let env = Env::default().default_filter_or("info");
        env_logger::init_from_env(env);
    }
    let config_path = match cli_args.config_file {
        Some(path) => PathBuf::from(path),
        None => Config::default_path()?,
    };
    let config = Config::read(&config_path, &cli_args.profile)?;

    // Persistent tokens first, then the token from config or environment.
    let mut stores: Vec<Arc<dyn TokenStore>> = Vec::new();
    if let Some(path) = cli_args
        .token_file
        .map(PathBuf::from)
        .or_else(|| config.token_file.clone())
    {
        stores.push(Arc::new(FileTokenStore::new(path)));
    }
    let process_store = Arc::new(MemoryTokenStore::new());
    if let Some(token) = &config.api_token {
        process_store.set(AUTH_TOKEN_KEY, token);
    }
    stores.push(process_store);
    let session = Arc::new(Session::new(stores, Arc::new(MemoryNavigator::default())));

    let client = ApiClient::builder()
        .config(config.client)
        .session(session)
        .build();
    let result = cmds::execute(&client, &command, &mut std::io::stdout());
    client.dispose();
    result
}
