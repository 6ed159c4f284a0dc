use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::commands::CommandHandler;
use crate::config::SignalConfig;
use crate::notify::Delivery;
use crate::utils::error::{AppError, Result};

/// Delivery over the signal-cli binary. One short-lived process per send.
pub struct SignalCli {
    config: SignalConfig,
}

impl SignalCli {
    pub fn new(config: SignalConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Delivery for SignalCli {
    async fn send(&self, destination: &str, message: &str) -> Result<()> {
        let output = Command::new(&self.config.cli_path)
            .arg("-u")
            .arg(&self.config.account)
            .arg("send")
            .arg("-g")
            .arg(destination)
            .arg("-m")
            .arg(message)
            .output()
            .await
            .map_err(|e| AppError::Delivery(format!("failed to run signal-cli: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::Delivery(format!(
                "signal-cli send exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        debug!(destination = %destination, "message delivered");
        Ok(())
    }
}

// signal-cli `receive --output=json` emits one JSON envelope per line.
// Only the fields the command loop needs are modelled.

#[derive(Debug, Deserialize)]
struct ReceiveLine {
    envelope: Option<Envelope>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    source_number: Option<String>,
    source_name: Option<String>,
    data_message: Option<DataMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataMessage {
    message: Option<String>,
    group_info: Option<GroupInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupInfo {
    group_id: Option<String>,
}

#[derive(Debug, PartialEq)]
pub(crate) struct InboundMessage {
    pub sender: String,
    pub sender_name: Option<String>,
    pub text: String,
    pub group_id: String,
}

/// Parses one receive line down to the bits the handler needs. Receipts,
/// typing indicators and anything without a text body come back as None.
pub(crate) fn parse_receive_line(line: &str) -> Option<InboundMessage> {
    let parsed: ReceiveLine = serde_json::from_str(line).ok()?;
    let envelope = parsed.envelope?;
    let data = envelope.data_message?;
    let text = data.message?;
    let group_id = data.group_info?.group_id?;
    let sender = envelope.source_number?;

    Some(InboundMessage {
        sender,
        sender_name: envelope.source_name,
        text,
        group_id,
    })
}

/// Polls signal-cli for inbound group messages and feeds them to the
/// command handler. Messages are processed in arrival order, so replies
/// for one sender come back in the order they asked.
pub struct SignalListener {
    config: SignalConfig,
    handler: Arc<CommandHandler>,
    delivery: Arc<dyn Delivery>,
}

impl SignalListener {
    pub fn new(
        config: SignalConfig,
        handler: Arc<CommandHandler>,
        delivery: Arc<dyn Delivery>,
    ) -> Self {
        Self {
            config,
            handler,
            delivery,
        }
    }

    pub async fn run(&self) {
        info!(account = %self.config.account, "signal listener started");
        loop {
            if let Err(e) = self.poll_once().await {
                error!(error = %e, "receive poll failed");
            }
            tokio::time::sleep(Duration::from_secs(self.config.poll_interval)).await;
        }
    }

    async fn poll_once(&self) -> Result<()> {
        let output = Command::new(&self.config.cli_path)
            .arg("-u")
            .arg(&self.config.account)
            .arg("receive")
            .arg("--output=json")
            .arg("-t")
            .arg("2")
            .output()
            .await
            .map_err(|e| AppError::Delivery(format!("failed to run signal-cli: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::Delivery(format!(
                "signal-cli receive exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            self.handle_line(line).await;
        }
        Ok(())
    }

    async fn handle_line(&self, line: &str) {
        let Some(inbound) = parse_receive_line(line) else {
            debug!("skipping non-message receive line");
            return;
        };

        if inbound.group_id != self.config.group_id {
            debug!(group_id = %inbound.group_id, "ignoring message from other group");
            return;
        }

        let reply = self
            .handler
            .handle(&inbound.sender, inbound.sender_name.as_deref(), &inbound.text)
            .await;

        if let Err(e) = self.delivery.send(&self.config.group_id, &reply).await {
            warn!(sender = %inbound.sender, error = %e, "failed to send reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_group_message() {
        let line = r#"{"envelope":{"source":"+61400000001","sourceNumber":"+61400000001","sourceName":"Alex","timestamp":1716800000000,"dataMessage":{"timestamp":1716800000000,"message":"track https://example.com/widget 50","groupInfo":{"groupId":"abc123==","type":"DELIVER"}}},"account":"+61400000000"}"#;

        assert_eq!(
            parse_receive_line(line),
            Some(InboundMessage {
                sender: "+61400000001".to_string(),
                sender_name: Some("Alex".to_string()),
                text: "track https://example.com/widget 50".to_string(),
                group_id: "abc123==".to_string(),
            })
        );
    }

    #[test]
    fn test_receipt_lines_are_skipped() {
        let receipt = r#"{"envelope":{"sourceNumber":"+61400000001","timestamp":1716800000000,"receiptMessage":{"when":1716800000000,"isDelivery":true}},"account":"+61400000000"}"#;
        assert_eq!(parse_receive_line(receipt), None);
    }

    #[test]
    fn test_direct_message_without_group_is_skipped() {
        let direct = r#"{"envelope":{"sourceNumber":"+61400000001","dataMessage":{"message":"list"}},"account":"+61400000000"}"#;
        assert_eq!(parse_receive_line(direct), None);
    }

    #[test]
    fn test_garbage_lines_are_skipped() {
        assert_eq!(parse_receive_line("not json at all"), None);
        assert_eq!(parse_receive_line("{}"), None);
    }
}
