//! Framed RPC client used by every subcommand: connect, log in, call
//! facade methods.

use anyhow::Context as _;
use bytes::{Buf, BufMut, BytesMut};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use common::api::{LoginRequest, LoginResult, RpcRequest, RpcResponse};
use common::params::user_tag;

use crate::args::GlobalArgs;

pub struct GatewayClient {
    stream: TcpStream,
    buffer: BytesMut,
    next_request_id: u64,
}

impl GatewayClient {
    /// Connects and logs in with the globally configured identity.
    pub async fn connect(globals: &GlobalArgs) -> anyhow::Result<Self> {
        let user = globals
            .user
            .clone()
            .context("no user configured; pass --user or set GHCTL_USER")?;
        let token = globals
            .token
            .clone()
            .context("no token configured; pass --token or set GHCTL_TOKEN")?;

        let stream = TcpStream::connect(&globals.gateway)
            .await
            .with_context(|| format!("cannot connect to gateway at {}", globals.gateway))?;
        let mut client = Self {
            stream,
            buffer: BytesMut::new(),
            next_request_id: 1,
        };

        let result = client
            .call(
                "Admin",
                3,
                "Login",
                serde_json::to_value(LoginRequest {
                    auth_tag: user_tag(&user),
                    credentials: token,
                })?,
            )
            .await?;
        let _login: LoginResult =
            serde_json::from_value(result).context("unexpected login response")?;
        Ok(client)
    }

    /// Invokes one facade method and returns the response payload. Error
    /// responses become failures carrying the wire code and message.
    pub async fn call(
        &mut self,
        facade: &str,
        version: u16,
        method: &str,
        params: Value,
    ) -> anyhow::Result<Value> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let request = RpcRequest {
            request_id,
            kind: facade.to_string(),
            version,
            id: String::new(),
            request: method.to_string(),
            params,
        };
        self.write_frame(&request).await?;

        let response: RpcResponse = self.read_frame().await?;
        if let Some(message) = response.error {
            let code = response.error_code.unwrap_or_default();
            anyhow::bail!("{message} ({code})");
        }
        Ok(response.response.unwrap_or(Value::Null))
    }

    async fn write_frame<T: serde::Serialize>(&mut self, frame: &T) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(frame)?;
        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);
        self.stream
            .write_all(&buf)
            .await
            .context("cannot send request")?;
        Ok(())
    }

    async fn read_frame<T: serde::de::DeserializeOwned>(&mut self) -> anyhow::Result<T> {
        loop {
            if self.buffer.len() >= 4 {
                let len = u32::from_be_bytes([
                    self.buffer[0],
                    self.buffer[1],
                    self.buffer[2],
                    self.buffer[3],
                ]) as usize;
                if self.buffer.len() >= 4 + len {
                    self.buffer.advance(4);
                    let payload = self.buffer.split_to(len);
                    return serde_json::from_slice(&payload).context("cannot parse response");
                }
            }
            let read = self
                .stream
                .read_buf(&mut self.buffer)
                .await
                .context("cannot read response")?;
            if read == 0 {
                anyhow::bail!("connection closed by gateway");
            }
        }
    }
}
