//! Rendering primitives. Callers build every post body through one of these
//! so no platform-specific syntax leaks into the pipeline.

pub trait Formatter: Send + Sync {
    fn bold(&self, text: &str) -> String;
    fn italic(&self, text: &str) -> String;
    fn strike(&self, text: &str) -> String;
    fn inline_code(&self, text: &str) -> String;
    fn code_block(&self, text: &str, language: Option<&str>) -> String;
    fn link(&self, label: &str, url: &str) -> String;
    fn mention(&self, user: &str) -> String;
    fn horizontal_rule(&self) -> String;
    fn blockquote(&self, text: &str) -> String;
    fn bullet_item(&self, text: &str) -> String;
    fn numbered_item(&self, index: usize, text: &str) -> String;
    /// Levels 1-3; deeper levels clamp to 3.
    fn heading(&self, level: u8, text: &str) -> String;
    fn table(&self, headers: &[&str], rows: &[Vec<String>]) -> String;
    fn key_value_list(&self, pairs: &[(&str, String)]) -> String;
    /// Neutralize any markup in untrusted text.
    fn escape(&self, text: &str) -> String;
}

/// Standard markdown, as Mattermost renders it.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownFormatter;

impl Formatter for MarkdownFormatter {
    fn bold(&self, text: &str) -> String {
        format!("**{text}**")
    }

    fn italic(&self, text: &str) -> String {
        format!("*{text}*")
    }

    fn strike(&self, text: &str) -> String {
        format!("~~{text}~~")
    }

    fn inline_code(&self, text: &str) -> String {
        format!("`{text}`")
    }

    fn code_block(&self, text: &str, language: Option<&str>) -> String {
        let lang = language.unwrap_or_default();
        let text = text.strip_suffix('\n').unwrap_or(text);
        format!("```{lang}\n{text}\n```")
    }

    fn link(&self, label: &str, url: &str) -> String {
        format!("[{label}]({url})")
    }

    fn mention(&self, user: &str) -> String {
        format!("@{user}")
    }

    fn horizontal_rule(&self) -> String {
        "\n---\n".to_string()
    }

    fn blockquote(&self, text: &str) -> String {
        text.lines()
            .map(|line| format!("> {line}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn bullet_item(&self, text: &str) -> String {
        format!("- {text}")
    }

    fn numbered_item(&self, index: usize, text: &str) -> String {
        format!("{index}. {text}")
    }

    fn heading(&self, level: u8, text: &str) -> String {
        let level = level.clamp(1, 3) as usize;
        format!("{} {text}", "#".repeat(level))
    }

    fn table(&self, headers: &[&str], rows: &[Vec<String>]) -> String {
        let mut out = String::new();
        out.push_str(&format!("| {} |\n", headers.join(" | ")));
        out.push_str(&format!("|{}\n", "---|".repeat(headers.len())));
        for row in rows {
            out.push_str(&format!("| {} |\n", row.join(" | ")));
        }
        out
    }

    fn key_value_list(&self, pairs: &[(&str, String)]) -> String {
        pairs
            .iter()
            .map(|(key, value)| format!("**{key}:** {value}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn escape(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for ch in text.chars() {
            if matches!(ch, '*' | '_' | '`' | '~' | '[' | ']' | '#' | '>' | '|') {
                out.push('\\');
            }
            out.push(ch);
        }
        out
    }
}

/// Slack's mrkdwn subset. No headings and no tables; both degrade to bold
/// lines so bodies stay legible.
#[derive(Debug, Clone, Copy, Default)]
pub struct MrkdwnFormatter;

impl Formatter for MrkdwnFormatter {
    fn bold(&self, text: &str) -> String {
        format!("*{text}*")
    }

    fn italic(&self, text: &str) -> String {
        format!("_{text}_")
    }

    fn strike(&self, text: &str) -> String {
        format!("~{text}~")
    }

    fn inline_code(&self, text: &str) -> String {
        format!("`{text}`")
    }

    fn code_block(&self, text: &str, _language: Option<&str>) -> String {
        // mrkdwn fences carry no language tag.
        let text = text.strip_suffix('\n').unwrap_or(text);
        format!("```\n{text}\n```")
    }

    fn link(&self, label: &str, url: &str) -> String {
        format!("<{url}|{label}>")
    }

    fn mention(&self, user: &str) -> String {
        format!("<@{user}>")
    }

    fn horizontal_rule(&self) -> String {
        "\n────────\n".to_string()
    }

    fn blockquote(&self, text: &str) -> String {
        text.lines()
            .map(|line| format!("> {line}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn bullet_item(&self, text: &str) -> String {
        format!("• {text}")
    }

    fn numbered_item(&self, index: usize, text: &str) -> String {
        format!("{index}. {text}")
    }

    fn heading(&self, _level: u8, text: &str) -> String {
        format!("*{text}*")
    }

    fn table(&self, headers: &[&str], rows: &[Vec<String>]) -> String {
        // Render as key-value lines, first column bolded.
        let mut out = String::new();
        out.push_str(&format!("*{}*\n", headers.join(" · ")));
        for row in rows {
            out.push_str(&format!("{}\n", row.join(" · ")));
        }
        out
    }

    fn key_value_list(&self, pairs: &[(&str, String)]) -> String {
        pairs
            .iter()
            .map(|(key, value)| format!("*{key}:* {value}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn escape(&self, text: &str) -> String {
        // mrkdwn treats &, < and > as control characters.
        text.replace('&', "&amp;")
            .replace('<', "&lt;")
            .replace('>', "&gt;")
    }
}
