use serde_json::json;

use common::api::{AddControllerRequest, AuditLogAccessRequest, ControllerInfo, ControllerInfoList};
use common::params::user_tag;

use crate::args::{AddControllerArgs, GlobalArgs};
use crate::client::GatewayClient;
use crate::view::write_output;

pub async fn handle_add_controller(
    globals: &GlobalArgs,
    args: AddControllerArgs,
) -> anyhow::Result<()> {
    let mut client = GatewayClient::connect(globals).await?;
    let result = client
        .call(
            "Gatehouse",
            1,
            "AddController",
            json!(AddControllerRequest {
                path: args.path,
                hosts: args.hosts,
                ca_cert: args.ca_cert,
                admin_user: args.admin_user,
                admin_password: args.admin_password,
                public: args.public,
            }),
        )
        .await?;
    let info: ControllerInfo = serde_json::from_value(result)?;
    write_output(globals.format, &info)
}

pub async fn handle_list_controllers(globals: &GlobalArgs) -> anyhow::Result<()> {
    let mut client = GatewayClient::connect(globals).await?;
    let result = client
        .call("Gatehouse", 1, "ListControllers", json!({}))
        .await?;
    let list: ControllerInfoList = serde_json::from_value(result)?;
    write_output(globals.format, &list.controllers)
}

pub async fn handle_grant_audit_log_access(
    globals: &GlobalArgs,
    user: String,
) -> anyhow::Result<()> {
    let mut client = GatewayClient::connect(globals).await?;
    client
        .call(
            "Gatehouse",
            1,
            "GrantAuditLogAccess",
            json!(AuditLogAccessRequest {
                user_tag: user_tag(&user),
            }),
        )
        .await?;
    Ok(())
}
