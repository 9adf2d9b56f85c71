pub mod args;
pub mod client;
pub mod commands;
pub mod parse;
pub mod view;

pub use args::{Cli, Commands, GlobalArgs, OutputFormat};
pub use parse::UsageError;

use clap::Parser;

/// Shared async entrypoint used by the ghctl binary.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run_parsed(cli).await
}

/// Execute the CLI given a pre-parsed argument struct.
pub async fn run_parsed(cli: Cli) -> anyhow::Result<()> {
    let globals = cli.globals.clone();
    match cli.command {
        Commands::Migrate { args } => commands::migrate::handle_migrate(&globals, args).await,
        Commands::AddController(args) => {
            commands::controllers::handle_add_controller(&globals, args).await
        }
        Commands::ListControllers => {
            commands::controllers::handle_list_controllers(&globals).await
        }
        Commands::GrantAuditLogAccess { user } => {
            commands::controllers::handle_grant_audit_log_access(&globals, user).await
        }
        Commands::UpdateCredentials(args) => {
            commands::credentials::handle_update_credentials(&globals, args).await
        }
    }
}
