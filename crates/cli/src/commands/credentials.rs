use std::collections::HashMap;

use serde_json::json;

use common::api::{
    CloudCredentialArgs, ErrorResults, TaggedCredential, UpdateCredentialsParams,
};
use common::params::{cloud_credential_tag, CredentialPath};

use crate::args::{GlobalArgs, UpdateCredentialsArgs};
use crate::client::GatewayClient;
use crate::parse::parse_attr;
use crate::view::write_output;

pub async fn handle_update_credentials(
    globals: &GlobalArgs,
    args: UpdateCredentialsArgs,
) -> anyhow::Result<()> {
    let user = globals
        .user
        .clone()
        .ok_or_else(|| anyhow::anyhow!("no user configured; pass --user or set GHCTL_USER"))?;

    let mut attrs: HashMap<String, String> = HashMap::new();
    for raw in &args.attrs {
        let (key, value) = parse_attr(raw)?;
        attrs.insert(key, value);
    }

    let path = CredentialPath::new(&args.cloud, &user, &args.name);
    let mut client = GatewayClient::connect(globals).await?;
    let result = client
        .call(
            "Cloud",
            5,
            "UpdateCredentials",
            json!(UpdateCredentialsParams {
                credentials: vec![TaggedCredential {
                    tag: cloud_credential_tag(&path),
                    credential: CloudCredentialArgs {
                        auth_type: args.auth_type,
                        attrs,
                    },
                }],
            }),
        )
        .await?;
    let results: ErrorResults = serde_json::from_value(result)?;
    if let Some(error) = results.results.first().and_then(|r| r.error.as_ref()) {
        anyhow::bail!("cannot update credential: {}", error.message);
    }
    write_output(globals.format, &json!({ "credential": path.to_string() }))
}
