use std::path::PathBuf;
use std::sync::Arc;

use authgate::errors::{ErrorCode, translate, translate_code};
use authgate::guard::{GuardOutcome, Requirement, decide};
use authgate::magic_link::landing_url;
use authgate::notify::{EmailRequestError, TemplateValue};
use authgate::provider::memory::MemoryProvider;
use authgate::provider::rest::{RestProvider, RestProviderConfig};
use authgate::redirect::RedirectIntent;
use authgate::storage::UnavailableStore;
use authgate::{
    AuthActions, AuthConfig, AuthError, EmailClient, EmailTemplate, FileStore, Identity, Location, MagicLinkFlow,
    MemoryRouter, MemoryStore, PendingLinkStore, ProviderError, RouteGuard, Router, SendEmailRequest, Session, SessionStore,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("missing identity API key; set IDENTITY_API_KEY")]
    MissingApiKey,
    #[error("configuration error: {0}")]
    Config(#[from] authgate::config::ConfigError),
    #[error("{message} [{code}]")]
    Auth { code: &'static str, message: &'static str },
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("invalid template variable {0:?}; expected name=value")]
    InvalidVariable(String),
    #[error("invalid email request: {0}")]
    EmailRequest(#[from] EmailRequestError),
    #[error("email not sent: {0}")]
    EmailRejected(String),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

impl From<AuthError> for CliError {
    fn from(error: AuthError) -> Self {
        Self::Auth { code: error.error_code(), message: translate(&error) }
    }
}

impl From<ProviderError> for CliError {
    fn from(error: ProviderError) -> Self {
        AuthError::from(error).into()
    }
}

#[derive(Parser, Debug)]
#[command(name = "authgate-cli", about = "Drive authgate sign-in flows against an identity provider")]
struct Cli {
    /// File holding persisted client state (the pending magic-link email).
    #[arg(long, env = "AUTHGATE_STORE", default_value = ".authgate/store.json")]
    store: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Email a sign-in link and remember the address locally.
    SendLink {
        #[arg(long)]
        email: String,
        /// Path to land on after sign-in, e.g. /app/dashboard?tab=settings.
        #[arg(long)]
        next: Option<String>,
    },
    /// Complete sign-in from a link opened from the email.
    VerifyLink {
        /// The emailed link, or the page it landed on.
        link: String,
        /// Needed when the link was requested from another device.
        #[arg(long)]
        email: Option<String>,
    },
    Login(Credentials),
    Signup(Credentials),
    /// Email a password reset code.
    ResetPassword {
        #[arg(long)]
        email: String,
    },
    /// Check a reset code and set a new password.
    ConfirmReset {
        #[arg(long)]
        code: String,
        #[arg(long, env = "AUTHGATE_NEW_PASSWORD")]
        password: String,
    },
    /// Sign in, then send a transactional email through the app endpoint.
    SendEmail(SendEmailArgs),
    /// Show what the route guard would do at a location.
    Check {
        location: String,
        #[arg(long, value_enum, default_value_t = SessionState::SignedOut)]
        session: SessionState,
        #[arg(long, value_enum, default_value_t = RequirementArg::VerifiedEmail)]
        require: RequirementArg,
    },
    /// Print the user-facing message for a provider error code.
    Explain { code: String },
    /// Run the magic-link round trips in-process against the in-memory provider.
    Demo {
        #[arg(long, default_value = "demo@example.com")]
        email: String,
    },
}

#[derive(Args, Debug)]
struct Credentials {
    #[arg(long)]
    email: String,
    #[arg(long, env = "AUTHGATE_PASSWORD")]
    password: String,
}

#[derive(Args, Debug)]
struct SendEmailArgs {
    #[command(flatten)]
    credentials: Credentials,
    #[arg(long)]
    to: String,
    #[arg(long)]
    subject: String,
    #[arg(long)]
    template: EmailTemplate,
    /// Template variable as name=value; repeatable.
    #[arg(long = "var")]
    variables: Vec<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SessionState {
    Loading,
    SignedOut,
    Unverified,
    Verified,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RequirementArg {
    SignedIn,
    VerifiedEmail,
}

/// Everything a networked command needs, wired from the environment.
struct CliContext {
    config: AuthConfig,
    provider: Arc<RestProvider>,
    session: Arc<SessionStore>,
    pending: PendingLinkStore,
    router: Arc<MemoryRouter>,
}

impl CliContext {
    fn from_env(store: PathBuf) -> Result<Self, CliError> {
        let config = AuthConfig::from_env()?;
        let rest_config = RestProviderConfig::from_env().ok_or(CliError::MissingApiKey)?;
        let provider = Arc::new(RestProvider::new(rest_config)?);
        let session = Arc::new(SessionStore::new(provider.clone()));
        session.initialize();
        let pending = PendingLinkStore::new(Arc::new(FileStore::new(store)), &config.storage_namespace);
        let router = Arc::new(MemoryRouter::new(config.app_origin.clone()));
        Ok(Self { config, provider, session, pending, router })
    }

    fn flow(&self) -> Result<MagicLinkFlow, CliError> {
        Ok(MagicLinkFlow::new(
            self.provider.clone(),
            self.pending.clone(),
            self.router.clone(),
            self.config.continue_url()?,
        ))
    }

    fn actions(&self) -> AuthActions {
        AuthActions::new(self.provider.clone(), Arc::clone(&self.session), self.pending.clone())
    }
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Check { location, session, require } => run_check(&location, session, require),
        Command::Explain { code } => {
            println!("{}", translate_code(Some(&code)));
            Ok(())
        }
        Command::Demo { email } => run_demo(&email).await,
        command => {
            let ctx = CliContext::from_env(cli.store)?;
            run_remote(&ctx, command).await
        }
    }
}

async fn run_remote(ctx: &CliContext, command: Command) -> Result<(), CliError> {
    match command {
        Command::SendLink { email, next } => {
            ctx.flow()?.send_link(&email, next.as_deref()).await?;
            print_json(&json!({ "sent": true, "email": email, "pendingKey": ctx.pending.key() }))
        }
        Command::VerifyLink { link, email } => {
            let landing = url::Url::parse(&link).map_or(link, |url| landing_url(&url).to_string());
            ctx.router.open(&landing)?;
            let next = ctx.flow()?.verify_link(email.as_deref()).await?;
            print_json(&json!({ "identity": ctx.session.session().identity, "next": next }))
        }
        Command::Login(credentials) => {
            let identity = ctx.actions().login_with_email(&credentials.email, &credentials.password).await?;
            print_identity(&identity)
        }
        Command::Signup(credentials) => {
            let identity = ctx.actions().signup_with_email(&credentials.email, &credentials.password).await?;
            print_identity(&identity)
        }
        Command::ResetPassword { email } => {
            ctx.actions().reset_password(&email).await?;
            print_json(&json!({ "sent": true, "email": email }))
        }
        Command::ConfirmReset { code, password } => {
            let actions = ctx.actions();
            let email = actions.verify_reset_code(&code).await?;
            actions.confirm_password_reset(&code, &password).await?;
            print_json(&json!({ "reset": true, "email": email }))
        }
        Command::SendEmail(args) => run_send_email(ctx, args).await,
        Command::Check { .. } | Command::Explain { .. } | Command::Demo { .. } => Ok(()),
    }
}

async fn run_send_email(ctx: &CliContext, args: SendEmailArgs) -> Result<(), CliError> {
    let mut request = SendEmailRequest::new(args.to, args.subject, args.template);
    for raw in args.variables {
        let (name, value) = raw.split_once('=').ok_or_else(|| CliError::InvalidVariable(raw.clone()))?;
        request = request.with_variable(name, template_value(value));
    }
    request.validate()?;

    ctx.actions().login_with_email(&args.credentials.email, &args.credentials.password).await?;
    let client = EmailClient::new(reqwest::Client::new(), ctx.config.send_email_url()?, ctx.provider.clone());
    let result = client.send(&request).await;
    if !result.ok {
        return Err(CliError::EmailRejected(result.message));
    }
    print_json(&serde_json::to_value(&result)?)
}

fn template_value(raw: &str) -> TemplateValue {
    match raw.parse::<i64>() {
        Ok(number) => number.into(),
        Err(_) => raw.into(),
    }
}

fn run_check(raw: &str, state: SessionState, require: RequirementArg) -> Result<(), CliError> {
    let config = AuthConfig::from_env()?;
    let location = Location::parse(&config.app_origin, raw)?;
    let identity = |verified| Some(Identity::new("cli-user", "user@example.com", verified));
    let session = match state {
        SessionState::Loading => Session::default(),
        SessionState::SignedOut => Session { identity: None, loading: false },
        SessionState::Unverified => Session { identity: identity(false), loading: false },
        SessionState::Verified => Session { identity: identity(true), loading: false },
    };
    let requirement = match require {
        RequirementArg::SignedIn => Requirement::SignedIn,
        RequirementArg::VerifiedEmail => Requirement::VerifiedEmail,
    };

    let outcome = decide(&session, &location, &config.routes(), requirement);
    let redirect = match &outcome {
        GuardOutcome::Redirect(target) => Some(target.clone()),
        GuardOutcome::Stay(_) => None,
    };
    print_json(&json!({
        "location": location.path_and_query(),
        "decision": format!("{:?}", outcome.decision()),
        "redirect": redirect,
    }))
}

/// Same-device and cross-device magic-link round trips, fully in memory.
async fn run_demo(email: &str) -> Result<(), CliError> {
    let config = AuthConfig::default();
    let provider = Arc::new(MemoryProvider::new());
    let session = Arc::new(SessionStore::new(provider.clone()));
    session.initialize();
    let router = Arc::new(MemoryRouter::new(config.app_origin.clone()));
    let guard = RouteGuard::new(Arc::clone(&session), router.clone(), config.routes());
    let device_a = PendingLinkStore::new(Arc::new(MemoryStore::new()), &config.storage_namespace);
    let flow_a = MagicLinkFlow::new(provider.clone(), device_a.clone(), router.clone(), config.continue_url()?);

    router.open("/app/dashboard?tab=settings")?;
    let decision = guard.evaluate();
    println!("guard at /app/dashboard?tab=settings: {decision:?} -> {}", router.current().path_and_query());

    let intent = RedirectIntent::from_location(&router.current());
    flow_a.send_link(email, intent.as_ref().map(RedirectIntent::as_str)).await?;
    let link = provider.last_sign_in_link(email).ok_or(CliError::Auth {
        code: "E_DEMO",
        message: "in-memory provider sent no link",
    })?;
    println!("link sent: {link}");

    router.open(link.as_str())?;
    let next = flow_a.verify_link(None).await?;
    println!("same device: signed in as {email}, next = {next:?}");
    if let Some(next) = next {
        router.open(&next)?;
    }
    println!("guard at {}: {:?}", router.current().path_and_query(), guard.evaluate());

    AuthActions::new(provider.clone(), Arc::clone(&session), device_a).logout().await;
    println!("logged out: signed in = {}", session.session().is_signed_in());

    flow_a.send_link(email, None).await?;
    let link = provider.last_sign_in_link(email).ok_or(CliError::Auth {
        code: "E_DEMO",
        message: "in-memory provider sent no link",
    })?;
    let device_b = PendingLinkStore::new(Arc::new(UnavailableStore), &config.storage_namespace);
    let flow_b = MagicLinkFlow::new(provider.clone(), device_b, router.clone(), config.continue_url()?);
    router.open(link.as_str())?;
    match flow_b.verify_link(None).await {
        Err(e) => println!("other device without email: {}", translate(&e)),
        Ok(_) => println!("other device without email: unexpectedly signed in"),
    }
    flow_b.verify_link(Some(email)).await?;
    println!("other device with email: signed in = {}", session.session().is_signed_in());
    Ok(())
}

fn print_identity(identity: &Identity) -> Result<(), CliError> {
    print_json(&serde_json::to_value(identity)?)
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
