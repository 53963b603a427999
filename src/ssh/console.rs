//! Interactive menu served on the SSH session channel.

use std::sync::Arc;

use log::{debug, info};
use unicode_width::UnicodeWidthChar;

use crate::error::TunnelError;
use crate::provisioner::Provisioner;
use crate::terminal_ui;

/// Input decoded by the [`LineEditor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditorEvent {
    /// Bytes to echo back to the terminal
    Echo(String),
    /// A completed line, without its terminator
    Line(String),
    /// Ctrl-C or Ctrl-D
    Interrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Escape {
    #[default]
    None,
    Start,
    Sequence,
}

/// Minimal line discipline for clients that send raw keystrokes.
#[derive(Debug, Default)]
pub struct LineEditor {
    buffer: String,
    pending: Vec<u8>,
    escape: Escape,
    last_was_cr: bool,
}

impl LineEditor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) -> Vec<EditorEvent> {
        self.pending.extend_from_slice(data);
        let text = match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let text = text.to_string();
                self.pending.clear();
                text
            }
            Err(e) if e.error_len().is_none() => {
                // Incomplete sequence at the end; keep it for the next chunk.
                let valid = e.valid_up_to();
                let text = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
                self.pending.drain(..valid);
                text
            }
            Err(_) => {
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                text
            }
        };

        let mut events = Vec::new();
        let mut echo = String::new();
        for c in text.chars() {
            if self.skip_escape(c) {
                continue;
            }
            let was_cr = std::mem::replace(&mut self.last_was_cr, c == '\r');
            match c {
                '\n' if was_cr => {}
                '\r' | '\n' => {
                    echo.push_str("\r\n");
                    flush_echo(&mut events, &mut echo);
                    events.push(EditorEvent::Line(std::mem::take(&mut self.buffer)));
                }
                '\u{7f}' | '\u{8}' => {
                    if let Some(removed) = self.buffer.pop() {
                        let width = removed.width().unwrap_or(0);
                        echo.push_str(&"\u{8} \u{8}".repeat(width));
                    }
                }
                '\u{3}' | '\u{4}' => {
                    flush_echo(&mut events, &mut echo);
                    events.push(EditorEvent::Interrupt);
                }
                '\u{1b}' => self.escape = Escape::Start,
                c if c.is_control() => {}
                c => {
                    self.buffer.push(c);
                    echo.push(c);
                }
            }
        }
        flush_echo(&mut events, &mut echo);
        events
    }

    fn skip_escape(&mut self, c: char) -> bool {
        match self.escape {
            Escape::None => false,
            Escape::Start => {
                self.escape = if c == '[' || c == 'O' {
                    Escape::Sequence
                } else {
                    Escape::None
                };
                true
            }
            Escape::Sequence => {
                if ('\u{40}'..='\u{7e}').contains(&c) {
                    self.escape = Escape::None;
                }
                true
            }
        }
    }
}

fn flush_echo(events: &mut Vec<EditorEvent>, echo: &mut String) {
    if !echo.is_empty() {
        events.push(EditorEvent::Echo(std::mem::take(echo)));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuState {
    Command,
    AwaitingUrl,
    AwaitingTunnelId,
    AwaitingDeleteId,
}

/// What the session should do after some input.
#[derive(Debug, Default)]
pub struct ConsoleReply {
    pub output: String,
    pub close: bool,
}

/// Command menu bound to one SSH session.
pub struct Console {
    provisioner: Arc<Provisioner>,
    fingerprint: Option<String>,
    editor: LineEditor,
    state: MenuState,
}

impl Console {
    pub fn new(provisioner: Arc<Provisioner>, fingerprint: Option<String>) -> Self {
        Self {
            provisioner,
            fingerprint,
            editor: LineEditor::new(),
            state: MenuState::Command,
        }
    }

    pub fn state(&self) -> MenuState {
        self.state
    }

    pub fn greeting(&self) -> String {
        terminal_ui::create_welcome_box(self.fingerprint.as_deref().unwrap_or("unknown"))
    }

    /// Feed raw channel data through the line editor and run complete lines.
    pub async fn handle_input(&mut self, data: &[u8]) -> ConsoleReply {
        let mut reply = ConsoleReply::default();
        for event in self.editor.feed(data) {
            match event {
                EditorEvent::Echo(text) => reply.output.push_str(&text),
                EditorEvent::Line(line) => {
                    let (output, close) = self.handle_line(line.trim()).await;
                    reply.output.push_str(&output);
                    if close {
                        reply.close = true;
                        break;
                    }
                }
                EditorEvent::Interrupt => {
                    reply.output.push_str("\r\nBye!\r\n");
                    reply.close = true;
                    break;
                }
            }
        }
        reply
    }

    async fn handle_line(&mut self, line: &str) -> (String, bool) {
        debug!("Console input in {:?}: '{}'", self.state, line);
        let output = match self.state {
            MenuState::Command => return self.handle_command(line).await,
            _ if line.eq_ignore_ascii_case("exit") => {
                self.state = MenuState::Command;
                "Cancelled.\r\n".to_string()
            }
            MenuState::AwaitingUrl => match self.setup(line).await {
                Ok(output) => {
                    self.state = MenuState::Command;
                    output
                }
                Err(e) => {
                    let mut output = terminal_ui::create_error_line(&e.to_string());
                    output.push_str(&terminal_ui::create_url_prompt());
                    return (output, false);
                }
            },
            MenuState::AwaitingTunnelId => {
                self.state = MenuState::Command;
                match self.owned_config(line).await {
                    Ok(config) => terminal_ui::create_tunnel_command_text(
                        &config,
                        &self.provisioner.tunnel_command(&config),
                    ),
                    Err(e) => terminal_ui::create_error_line(&e.to_string()),
                }
            }
            MenuState::AwaitingDeleteId => {
                self.state = MenuState::Command;
                match self.delete(line).await {
                    Ok(id) => format!("Deleted webhook {}.\r\n", id),
                    Err(e) => terminal_ui::create_error_line(&e.to_string()),
                }
            }
        };
        (with_prompt(output), false)
    }

    async fn handle_command(&mut self, line: &str) -> (String, bool) {
        let command = line.to_ascii_lowercase();
        let output = match command.as_str() {
            "" => String::new(),
            "setup" => {
                if self.fingerprint.is_none() {
                    terminal_ui::create_error_line(&TunnelError::MissingPublicKey.to_string())
                } else {
                    self.state = MenuState::AwaitingUrl;
                    return (terminal_ui::create_url_prompt(), false);
                }
            }
            "tunnel" => {
                self.state = MenuState::AwaitingTunnelId;
                return (terminal_ui::create_id_prompt(), false);
            }
            "delete" => {
                self.state = MenuState::AwaitingDeleteId;
                return (terminal_ui::create_id_prompt(), false);
            }
            "list" => {
                let configs = self.owned_configs().await;
                terminal_ui::create_webhook_list(&configs, "No webhooks yet, run setup.")
            }
            "active" => {
                let configs: Vec<_> = self
                    .owned_configs()
                    .await
                    .into_iter()
                    .filter(|c| c.is_active())
                    .collect();
                terminal_ui::create_webhook_list(&configs, "No active tunnels.")
            }
            "help" => terminal_ui::create_help_text(),
            "exit" => return ("Bye!\r\n".to_string(), true),
            other => terminal_ui::create_error_line(&format!(
                "unknown command '{}', type help for a list",
                other
            )),
        };
        (with_prompt(output), false)
    }

    async fn setup(&self, target: &str) -> Result<String, TunnelError> {
        let fingerprint = self
            .fingerprint
            .as_deref()
            .ok_or(TunnelError::MissingPublicKey)?;
        let config = self.provisioner.create_webhook(fingerprint, target).await?;
        Ok(terminal_ui::create_setup_box(
            &config,
            &self.provisioner.tunnel_command(&config),
        ))
    }

    async fn delete(&self, id: &str) -> Result<String, TunnelError> {
        let config = self.owned_config(id).await?;
        self.provisioner.deprovision(&config.id).await?;
        info!("Webhook {} deleted from its console", config.id);
        Ok(config.id)
    }

    async fn owned_configs(&self) -> Vec<crate::types::WebhookConfig> {
        match &self.fingerprint {
            Some(fp) => self.provisioner.store().list_by_public_key(fp).await,
            None => Vec::new(),
        }
    }

    /// A config by id, as long as it belongs to this session's key.
    async fn owned_config(&self, id: &str) -> Result<crate::types::WebhookConfig, TunnelError> {
        let config = self.provisioner.get_config(id).await?;
        match &self.fingerprint {
            Some(fp) if *fp == config.public_key_fingerprint => Ok(config),
            _ => Err(TunnelError::WebhookNotFound(id.to_string())),
        }
    }
}

fn with_prompt(mut output: String) -> String {
    output.push_str(terminal_ui::PROMPT);
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioner::ProvisionerSettings;
    use crate::store::SessionStore;

    fn console(fingerprint: Option<&str>) -> Console {
        let provisioner = Provisioner::new(
            ProvisionerSettings::default(),
            Arc::new(SessionStore::new()),
        );
        Console::new(Arc::new(provisioner), fingerprint.map(str::to_string))
    }

    #[test]
    fn test_editor_echoes_and_completes_lines() {
        let mut editor = LineEditor::new();
        assert_eq!(
            editor.feed(b"li"),
            vec![EditorEvent::Echo("li".to_string())]
        );
        assert_eq!(
            editor.feed(b"st\r\n"),
            vec![
                EditorEvent::Echo("st\r\n".to_string()),
                EditorEvent::Line("list".to_string()),
            ]
        );
        // The LF after CR does not produce a second, empty line.
        assert_eq!(editor.feed(b"x\n"), vec![
            EditorEvent::Echo("x\r\n".to_string()),
            EditorEvent::Line("x".to_string()),
        ]);
    }

    #[test]
    fn test_editor_backspace_uses_display_width() {
        let mut editor = LineEditor::new();
        editor.feed("a界".as_bytes());
        assert_eq!(
            editor.feed(b"\x7f"),
            vec![EditorEvent::Echo("\u{8} \u{8}\u{8} \u{8}".to_string())]
        );
        assert_eq!(
            editor.feed(b"\x08\x08\r"),
            vec![
                EditorEvent::Echo("\u{8} \u{8}\r\n".to_string()),
                EditorEvent::Line(String::new()),
            ]
        );
    }

    #[test]
    fn test_editor_skips_escape_sequences_and_split_utf8() {
        let mut editor = LineEditor::new();
        assert!(editor.feed(b"\x1b[A\x1b[1;5C").is_empty());
        let bytes = "é".as_bytes();
        assert!(editor.feed(&bytes[..1]).is_empty());
        assert_eq!(editor.feed(&bytes[1..]), vec![EditorEvent::Echo("é".to_string())]);
        assert_eq!(editor.feed(b"\x03"), vec![EditorEvent::Interrupt]);
    }

    #[tokio::test]
    async fn test_setup_flow_creates_owned_webhook() {
        let mut console = console(Some("SHA256:me"));

        let reply = console.handle_input(b"setup\r").await;
        assert!(reply.output.contains("Target URL"));
        assert_eq!(console.state(), MenuState::AwaitingUrl);

        let reply = console.handle_input(b"ftp://nope\r").await;
        assert!(reply.output.contains("invalid scheme"));
        assert_eq!(console.state(), MenuState::AwaitingUrl);

        let reply = console.handle_input(b"localhost:3000/hook\r").await;
        assert!(reply.output.contains("WEBHOOK CREATED"));
        assert!(reply.output.contains("ssh -R 0:127.0.0.1:3000 localhost -p 2222 tunnel"));
        assert_eq!(console.state(), MenuState::Command);
        assert!(!reply.close);

        let owned = console.owned_configs().await;
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].path, "/hook");

        let reply = console.handle_input(b"list\r").await;
        assert!(reply.output.contains(&owned[0].id));
        let reply = console.handle_input(b"active\r").await;
        assert!(reply.output.contains("No active tunnels."));
    }

    #[tokio::test]
    async fn test_tunnel_and_delete_check_ownership() {
        let mut console = console(Some("SHA256:me"));
        let mine = console
            .provisioner
            .create_webhook("SHA256:me", "http://127.0.0.1:8080")
            .await
            .unwrap();
        let theirs = console
            .provisioner
            .create_webhook("SHA256:other", "http://127.0.0.1:8081")
            .await
            .unwrap();

        console.handle_input(b"tunnel\r").await;
        let reply = console
            .handle_input(format!("{}\r", mine.id).as_bytes())
            .await;
        assert!(reply.output.contains("ssh -R 0:127.0.0.1:8080"));

        console.handle_input(b"delete\r").await;
        let reply = console
            .handle_input(format!("{}\r", theirs.id).as_bytes())
            .await;
        assert!(reply.output.contains("not found"));
        assert!(console.provisioner.get_config(&theirs.id).await.is_ok());

        console.handle_input(b"delete\r").await;
        let reply = console
            .handle_input(format!("{}\r", mine.id).as_bytes())
            .await;
        assert!(reply.output.contains("Deleted webhook"));
        assert!(console.provisioner.get_config(&mine.id).await.is_err());
    }

    #[tokio::test]
    async fn test_setup_requires_public_key() {
        let mut console = console(None);
        let reply = console.handle_input(b"setup\r").await;
        assert!(reply.output.contains("no public key"));
        assert_eq!(console.state(), MenuState::Command);
    }

    #[tokio::test]
    async fn test_exit_cancel_and_unknown() {
        let mut console = console(Some("SHA256:me"));
        console.handle_input(b"setup\r").await;
        let reply = console.handle_input(b"exit\r").await;
        assert!(reply.output.contains("Cancelled"));
        assert!(!reply.close);

        let reply = console.handle_input(b"frobnicate\r").await;
        assert!(reply.output.contains("unknown command 'frobnicate'"));

        let reply = console.handle_input(b"help\r").await;
        assert!(reply.output.contains("setup"));

        let reply = console.handle_input(b"exit\r").await;
        assert!(reply.close);
    }
}
