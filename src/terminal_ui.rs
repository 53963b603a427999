//! Text blocks written to SSH terminals.
//!
//! Uses the `console` crate for styling and width calculation. Everything
//! here returns `\r\n` terminated strings ready to be sent on a channel.

use console::{measure_text_width, pad_str, style, Alignment};

use crate::types::{RequestAnalytic, WebhookConfig};

/// Inner content width, excluding borders
const BOX_WIDTH: usize = 58;

pub const PROMPT: &str = "> ";

fn top_border() -> String {
    format!("╔{}╗\r\n", "═".repeat(BOX_WIDTH + 2))
}

fn middle_border() -> String {
    format!("╠{}╣\r\n", "═".repeat(BOX_WIDTH + 2))
}

fn bottom_border() -> String {
    format!("╚{}╝\r\n", "═".repeat(BOX_WIDTH + 2))
}

fn content_line(text: &str) -> String {
    let padded = pad_str(text, BOX_WIDTH, Alignment::Left, Some("..."));
    format!("║ {} ║\r\n", padded)
}

fn centered_line(text: &str) -> String {
    let padded = pad_str(text, BOX_WIDTH, Alignment::Center, None);
    format!("║ {} ║\r\n", padded)
}

fn empty_line() -> String {
    content_line("")
}

fn boxed(title: &str, lines: &[String]) -> String {
    let mut output = String::new();
    output.push_str("\r\n");
    output.push_str(&top_border());
    output.push_str(&centered_line(title));
    output.push_str(&middle_border());
    output.push_str(&empty_line());
    for line in lines {
        output.push_str(&content_line(line));
    }
    output.push_str(&empty_line());
    output.push_str(&bottom_border());
    output
}

/// Shorten `text` to fit in `width` columns.
pub fn truncate(text: &str, width: usize) -> String {
    if measure_text_width(text) <= width {
        return text.to_string();
    }
    let kept: String = text.chars().take(width.saturating_sub(3)).collect();
    format!("{}...", kept)
}

pub fn create_welcome_box(fingerprint: &str) -> String {
    let title = format!("{} WEBHOOK TUNNELS", style("⚡").yellow());
    let lines = vec![
        format!("Key: {}", style(truncate(fingerprint, BOX_WIDTH - 5)).dim()),
        String::new(),
        format!("Type {} to create a webhook,", style("setup").bold()),
        format!("or {} for all commands.", style("help").bold()),
    ];
    let mut output = boxed(&title, &lines);
    output.push_str("\r\n");
    output.push_str(PROMPT);
    output
}

pub fn create_help_text() -> String {
    let commands = [
        ("setup", "create a webhook for a local URL"),
        ("tunnel", "print the tunnel command of a webhook"),
        ("list", "list your webhooks"),
        ("active", "list your webhooks with a live tunnel"),
        ("delete", "remove a webhook"),
        ("help", "show this help"),
        ("exit", "close the session"),
    ];
    let mut output = String::from("\r\nCommands:\r\n");
    for (name, description) in commands {
        output.push_str(&format!(
            "  {}  {}\r\n",
            style(pad_str(name, 8, Alignment::Left, None)).bold(),
            description
        ));
    }
    output
}

pub fn create_url_prompt() -> String {
    format!(
        "Target URL {}: ",
        style("(e.g. http://localhost:3000/hook, 'exit' to cancel)").dim()
    )
}

pub fn create_id_prompt() -> String {
    format!("Webhook id {}: ", style("('exit' to cancel)").dim())
}

/// Shown after `setup` stored a new webhook.
pub fn create_setup_box(config: &WebhookConfig, tunnel_command: &str) -> String {
    let title = format!("{} WEBHOOK CREATED", style("✓").green());
    let lines = vec![
        format!("Id:          {}", config.id),
        format!("Forwards to: {}://{}{}", config.scheme, config.client_socket, config.path),
    ];
    let mut output = boxed(&title, &lines);
    output.push_str(&format!(
        "\r\nPublic URL:\r\n\r\n  {}\r\n",
        style(&config.public_url).cyan().underlined()
    ));
    output.push_str(&format!(
        "\r\nStart the tunnel with:\r\n\r\n  {}\r\n\r\n",
        style(tunnel_command).yellow()
    ));
    output
}

pub fn create_tunnel_command_text(config: &WebhookConfig, tunnel_command: &str) -> String {
    format!(
        "\r\n{} {}\r\n\r\n  {}\r\n\r\n",
        style("➜").cyan(),
        config.public_url,
        style(tunnel_command).yellow()
    )
}

pub fn create_webhook_list(configs: &[WebhookConfig], empty_message: &str) -> String {
    if configs.is_empty() {
        return format!("\r\n{}\r\n", style(empty_message).dim());
    }
    let mut output = String::from("\r\n");
    for config in configs {
        let status = if config.is_active() {
            style("active").green().to_string()
        } else {
            style("idle").dim().to_string()
        };
        output.push_str(&format!(
            "  {}  {}  {}\r\n    {}\r\n",
            config.id,
            pad_str(&status, 6, Alignment::Left, None),
            config.client_socket,
            style(&config.public_url).cyan()
        ));
    }
    output
}

/// Shown on the `tunnel` exec session once its webhooks are bound.
pub fn create_tunnel_connected_box(configs: &[WebhookConfig]) -> String {
    let title = format!("{} TUNNEL CONNECTED", style("✓").green());
    let lines: Vec<String> = configs
        .iter()
        .map(|c| format!("Local Binding: {}", c.client_socket))
        .collect();
    let mut output = boxed(&title, &lines);
    output.push_str("\r\n");
    for config in configs {
        output.push_str(&format!(
            "{} {}\r\n",
            style("➜").cyan(),
            style(&config.public_url).cyan().underlined()
        ));
    }
    output.push_str(&format!("\r\n{}\r\n", style("Listening for requests...").dim()));
    output
}

pub fn create_error_line(message: &str) -> String {
    format!("{} {}\r\n", style("✗").red(), message)
}

/// Shown before a session is closed because its bind was refused.
pub fn create_rejection_box(reason: &str) -> String {
    let title = format!("{} TUNNEL REFUSED", style("✗").red());
    let lines = vec![
        format!("{} {}", style("✗").red(), truncate(reason, BOX_WIDTH - 2)),
        String::new(),
        "Run setup first, or check the webhook is not".to_string(),
        "already bound by another session.".to_string(),
    ];
    let mut output = boxed(&title, &lines);
    output.push_str("\r\n");
    output
}

pub fn create_analytics_line(analytic: &RequestAnalytic) -> String {
    let marker = if analytic.response_code < 400 {
        style("➜").green()
    } else {
        style("➜").red()
    };
    format!("{} {}\r\n", marker, analytic)
}
