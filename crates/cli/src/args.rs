use clap::{Args, Parser, Subcommand, ValueEnum};

/// ghctl administers a gatehouse deployment over its RPC endpoint.
#[derive(Debug, Parser)]
#[command(name = "ghctl", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub globals: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Args)]
pub struct GlobalArgs {
    /// Gateway RPC endpoint.
    #[arg(
        long,
        global = true,
        env = "GHCTL_GATEWAY",
        default_value = "127.0.0.1:17070"
    )]
    pub gateway: String,

    /// Username to authenticate as.
    #[arg(long, global = true, env = "GHCTL_USER")]
    pub user: Option<String>,

    /// Login token for the user.
    #[arg(long, global = true, env = "GHCTL_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Output format.
    #[arg(long, global = true, value_enum, default_value = "yaml")]
    pub format: OutputFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Migrate models to the target controller.
    ///
    /// Takes the target controller name followed by one or more model tags
    /// of the form "model-<UUID>".
    #[command(trailing_var_arg = true)]
    Migrate {
        #[arg(num_args = 0..)]
        args: Vec<String>,
    },

    /// Register a new controller with the gateway.
    AddController(AddControllerArgs),

    /// List the controllers the gateway fronts.
    ListControllers,

    /// Allow a user to read the audit log.
    GrantAuditLogAccess {
        /// Username to grant access to.
        user: String,
    },

    /// Store a cloud credential and push it to every controller using it.
    UpdateCredentials(UpdateCredentialsArgs),
}

#[derive(Debug, Clone, Args)]
pub struct AddControllerArgs {
    /// Path of the controller, "user/name".
    pub path: String,

    /// API host:port; repeatable.
    #[arg(long = "host", required = true)]
    pub hosts: Vec<String>,

    /// CA certificate, PEM.
    #[arg(long, default_value = "")]
    pub ca_cert: String,

    #[arg(long)]
    pub admin_user: String,

    #[arg(long)]
    pub admin_password: String,

    /// Make the controller eligible for any user's models.
    #[arg(long)]
    pub public: bool,
}

#[derive(Debug, Clone, Args)]
pub struct UpdateCredentialsArgs {
    /// Cloud the credential belongs to.
    pub cloud: String,

    /// Name of the credential.
    pub name: String,

    #[arg(long)]
    pub auth_type: String,

    /// Credential attribute, "key=value"; repeatable.
    #[arg(long = "attr")]
    pub attrs: Vec<String>,
}
