use serde_json::json;

use common::api::{MigrateModelInfo, MigrateModelRequest, MigrationEvents};

use crate::args::GlobalArgs;
use crate::client::GatewayClient;
use crate::parse::parse_migrate_args;
use crate::view::write_output;

pub async fn handle_migrate(globals: &GlobalArgs, args: Vec<String>) -> anyhow::Result<()> {
    let (target, tags) = parse_migrate_args(&args)?;

    let specs: Vec<MigrateModelInfo> = tags
        .into_iter()
        .map(|model_tag| MigrateModelInfo {
            model_tag,
            target_controller: target.clone(),
        })
        .collect();

    let mut client = GatewayClient::connect(globals).await?;
    let result = client
        .call(
            "Gatehouse",
            2,
            "MigrateModel",
            json!(MigrateModelRequest { specs }),
        )
        .await?;
    let events: MigrationEvents = serde_json::from_value(result)?;
    write_output(globals.format, &events.events)
}
