use std::io::{self, BufRead};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use portal::config::{self, ConfigError, PortalConfig};
use portal::net::api::HttpAuthApi;
use portal::net::types::ApiError;
use portal::pages::login::{LoginForm, SubmitOutcome};
use portal::routes::{Navigator, Route};
use portal::state::session::{Session, SessionError};
use portal::storage::FileTokenStore;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("http client error: {0}")]
    Api(#[from] ApiError),
    #[error("{0}")]
    Session(#[from] SessionError),
    #[error("{0}")]
    Form(String),
    #[error("failed to read password from stdin: {0}")]
    Stdin(#[from] io::Error),
    #[error("invalid JSON output: {0}")]
    Json(#[from] serde_json::Error),
    #[error("not logged in")]
    NotLoggedIn,
    #[error("current user does not have role `{0}`")]
    MissingRole(String),
}

#[derive(Parser, Debug)]
#[command(name = "portal-cli", about = "Portal login and session CLI")]
struct Cli {
    /// Overrides `API_BASE_URL`.
    #[arg(long)]
    api_base_url: Option<String>,

    /// Overrides `PORTAL_TOKEN_DIR`.
    #[arg(long)]
    token_dir: Option<PathBuf>,

    #[arg(long)]
    request_timeout_secs: Option<u64>,

    #[arg(long)]
    connect_timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in, store the token, and print the user with its landing route.
    Login {
        #[arg(long)]
        email: String,
        /// Read from stdin when neither the flag nor `PORTAL_PASSWORD` is set.
        #[arg(long, env = "PORTAL_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Restore the stored session and print the current user.
    Whoami,
    /// Forget the stored token.
    Logout,
    /// Replace the stored token without contacting the server.
    SetToken { token: String },
    /// Exit non-zero unless the restored user has `role`.
    HasRole { role: String },
}

impl Cli {
    /// Flags win over the environment; `.env` is loaded before this runs.
    fn config(&self) -> Result<PortalConfig, ConfigError> {
        PortalConfig::from_lookup(|key| self.lookup(key))
    }

    fn token_dir(&self) -> PathBuf {
        config::token_dir_from_lookup(|key| self.lookup(key)).unwrap_or_else(FileTokenStore::default_dir)
    }

    fn lookup(&self, key: &str) -> Option<String> {
        self.flag(key).or_else(|| std::env::var(key).ok())
    }

    fn flag(&self, key: &str) -> Option<String> {
        match key {
            config::API_BASE_URL_VAR => self.api_base_url.clone(),
            config::REQUEST_TIMEOUT_VAR => self.request_timeout_secs.map(|v| v.to_string()),
            config::CONNECT_TIMEOUT_VAR => self.connect_timeout_secs.map(|v| v.to_string()),
            config::TOKEN_DIR_VAR => self.token_dir.as_ref().map(|p| p.display().to_string()),
            _ => None,
        }
    }
}

/// Terminal "navigation": report where a browser would have gone.
struct ConsoleNavigator;

impl Navigator for ConsoleNavigator {
    fn navigate(&self, route: Route) {
        eprintln!("-> {route}");
    }
}

type CliSession<A> = Session<A, FileTokenStore, ConsoleNavigator>;

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt().with_writer(io::stderr).init();

    run(Cli::parse()).await
}

/// Token-only commands run without an API, so they need no base URL.
async fn run(cli: Cli) -> Result<(), CliError> {
    let token_dir = cli.token_dir();
    let config = cli.config();
    match cli.command {
        Command::Logout => run_logout(&offline_session(token_dir)),
        Command::SetToken { token } => run_set_token(&offline_session(token_dir), &token),
        command => {
            let session = online_session(&config?)?;
            let result = run_online(&session, command).await;
            session.teardown();
            result
        }
    }
}

async fn run_online(session: &CliSession<HttpAuthApi>, command: Command) -> Result<(), CliError> {
    match command {
        Command::Login { email, password } => run_login(session, email, password).await,
        Command::Whoami => run_whoami(session).await,
        Command::Logout => run_logout(session),
        Command::SetToken { token } => run_set_token(session, &token),
        Command::HasRole { role } => run_has_role(session, role).await,
    }
}

fn offline_session(dir: PathBuf) -> CliSession<()> {
    tracing::debug!(token_dir = %dir.display(), "offline session");
    Session::new((), FileTokenStore::in_dir(dir), ConsoleNavigator)
}

fn online_session(config: &PortalConfig) -> Result<CliSession<HttpAuthApi>, CliError> {
    let api = HttpAuthApi::new(&config.api_base_url, config.timeouts)?;
    let dir = config.token_dir.clone().unwrap_or_else(FileTokenStore::default_dir);
    tracing::debug!(base_url = %api.base_url(), token_dir = %dir.display(), "session configured");
    Ok(Session::new(api, FileTokenStore::in_dir(dir), ConsoleNavigator))
}

async fn run_login(session: &CliSession<HttpAuthApi>, email: String, password: Option<String>) -> Result<(), CliError> {
    let password = match password {
        Some(password) => password,
        None => read_password()?,
    };

    session.initialize().await;

    let mut form = LoginForm::new();
    form.set_email(email);
    form.set_password(password);

    match form.submit(session).await {
        SubmitOutcome::Succeeded { route, user } => {
            print_json(&json!({ "route": route.path(), "user": user }))?;
            Ok(())
        }
        SubmitOutcome::Rejected => Err(CliError::Form(rejection_message(&form))),
        SubmitOutcome::Ignored => Err(CliError::Form("a login is already in progress".to_owned())),
        SubmitOutcome::Failed(message) => Err(CliError::Form(message)),
    }
}

async fn run_whoami(session: &CliSession<HttpAuthApi>) -> Result<(), CliError> {
    let state = session.initialize().await;
    let user = state.user.ok_or(CliError::NotLoggedIn)?;
    print_json(&serde_json::to_value(&user)?)
}

fn run_logout<A>(session: &CliSession<A>) -> Result<(), CliError> {
    session.logout()?;
    println!("logged out");
    Ok(())
}

fn run_set_token<A>(session: &CliSession<A>, token: &str) -> Result<(), CliError> {
    session.update_token(token)?;
    println!("token updated");
    Ok(())
}

async fn run_has_role(session: &CliSession<HttpAuthApi>, role: String) -> Result<(), CliError> {
    session.initialize().await;
    if !session.is_authenticated() {
        return Err(CliError::NotLoggedIn);
    }
    if !session.has_role(&role) {
        return Err(CliError::MissingRole(role));
    }
    println!("yes");
    Ok(())
}

/// Banner plus each field's helper text, one line.
fn rejection_message(form: &LoginForm) -> String {
    let errors = form.errors();
    let helpers: Vec<&str> = [errors.email_helper(), errors.password_helper()]
        .into_iter()
        .flatten()
        .collect();
    let banner = form.banner().unwrap_or_default();
    if helpers.is_empty() {
        banner.to_owned()
    } else {
        format!("{banner}: {}", helpers.join("; "))
    }
}

fn read_password() -> Result<String, CliError> {
    eprint!("password: ");
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_owned())
}

fn print_json(value: &serde_json::Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_lookup_keys() {
        let cli = Cli::try_parse_from([
            "portal-cli",
            "--api-base-url",
            "http://flag.test/",
            "--request-timeout-secs",
            "12",
            "--token-dir",
            "/tmp/portal-flags",
            "whoami",
        ])
        .unwrap();
        let config = cli.config().unwrap();
        assert_eq!(config.api_base_url, "http://flag.test");
        assert_eq!(config.timeouts.request_secs, 12);
        assert_eq!(config.token_dir, Some(PathBuf::from("/tmp/portal-flags")));
    }

    #[test]
    fn unknown_keys_have_no_flag() {
        let cli = Cli::try_parse_from(["portal-cli", "logout"]).unwrap();
        assert_eq!(cli.flag("HOME"), None);
        assert_eq!(cli.flag(config::API_BASE_URL_VAR), None);
    }

    #[test]
    fn login_takes_email_and_optional_password() {
        let cli = Cli::try_parse_from(["portal-cli", "login", "--email", "boss@acme.io", "--password", "secret1"])
            .unwrap();
        let Command::Login { email, password } = cli.command else {
            panic!("expected login command");
        };
        assert_eq!(email, "boss@acme.io");
        assert_eq!(password.as_deref(), Some("secret1"));
    }

    #[tokio::test]
    async fn token_only_commands_skip_api_config() {
        let dir = tempfile::tempdir().unwrap();
        let dir_arg = dir.path().to_str().unwrap();
        let token_file = dir.path().join("token");

        let set = Cli::try_parse_from(["portal-cli", "--token-dir", dir_arg, "set-token", "abc"]).unwrap();
        run(set).await.unwrap();
        assert_eq!(std::fs::read_to_string(&token_file).unwrap(), "abc");

        let logout = Cli::try_parse_from(["portal-cli", "--token-dir", dir_arg, "logout"]).unwrap();
        run(logout).await.unwrap();
        assert!(!token_file.exists());
    }

    #[test]
    fn token_dir_flag_needs_no_base_url() {
        let cli = Cli::try_parse_from(["portal-cli", "--token-dir", "/tmp/portal-offline", "logout"]).unwrap();
        assert_eq!(cli.token_dir(), PathBuf::from("/tmp/portal-offline"));
    }

    #[test]
    fn rejection_message_lists_field_helpers() {
        let mut form = LoginForm::new();
        form.set_email("bad-email");
        form.set_password("123");
        assert!(!form.validate());
        assert_eq!(
            rejection_message(&form),
            "Please fix form errors: Please enter a valid email; Password must be at least 6 characters"
        );
    }
}
