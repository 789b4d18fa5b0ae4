//! The channel sticky overview: one pinned post per channel describing all
//! active sessions. Rendering is a pure function of the session snapshots
//! plus fixed context, so the supervisor can diff against the last-posted
//! body and skip no-op updates.

use chrono::DateTime;
use chrono::Utc;
use coderelay_platform::Formatter;
use coderelay_protocol::manager_event::SessionLifecycle;

use crate::session::SessionInfo;

/// Sessions quiet for longer than this render with the idle bullet.
const IDLE_AFTER_SECS: i64 = 5 * 60;

pub struct OverviewContext<'a> {
    pub version: &'a str,
    pub started_at: DateTime<Utc>,
    pub max_sessions: usize,
}

fn format_uptime(started_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = now.signed_duration_since(started_at).num_seconds().max(0);
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    }
}

fn status_bullet(info: &SessionInfo, now: DateTime<Utc>) -> &'static str {
    match info.lifecycle {
        SessionLifecycle::Starting => "🟡",
        SessionLifecycle::Active | SessionLifecycle::Idle => {
            let idle_for = now.signed_duration_since(info.last_activity_at).num_seconds();
            if idle_for >= IDLE_AFTER_SECS { "🌙" } else { "🟢" }
        }
        SessionLifecycle::Paused => "⏸️",
        SessionLifecycle::Restarting => "🔄",
        SessionLifecycle::Cancelled => "⚫",
    }
}

pub fn render_overview(
    f: &dyn Formatter,
    ctx: &OverviewContext<'_>,
    sessions: &[SessionInfo],
    now: DateTime<Utc>,
) -> String {
    let mut sessions: Vec<&SessionInfo> = sessions.iter().collect();
    sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let mut out = format!(
        "🤖 {} v{} · up {} · {}/{} sessions",
        f.bold("coderelay"),
        ctx.version,
        format_uptime(ctx.started_at, now),
        sessions.len(),
        ctx.max_sessions,
    );

    if sessions.is_empty() {
        out.push_str("\n\nNo active sessions. Mention the bot to start one.");
        return out;
    }

    for info in sessions {
        let mut line = format!(
            "\n{} {}",
            status_bullet(info, now),
            f.mention(&info.owner)
        );
        if let Some(topic) = &info.topic {
            line.push_str(&format!(" — {topic}"));
        }
        if info.task_total > 0 {
            line.push_str(&format!(" · 📋 {}/{}", info.task_done, info.task_total));
        }
        if let Some(cost) = info.total_cost_usd {
            line.push_str(&format!(" · ${cost:.2}"));
        }
        if info.pending_prompt {
            line.push_str(" · ⏳ waiting on a reaction");
        }
        out.push_str(&line);
    }
    out
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use chrono::TimeDelta;
    use coderelay_platform::MarkdownFormatter;
    use pretty_assertions::assert_eq;

    use super::*;

    fn info(session_id: &str, created_at: DateTime<Utc>) -> SessionInfo {
        SessionInfo {
            session_id: session_id.to_string(),
            channel_id: "c1".to_string(),
            thread_id: "t1".to_string(),
            owner: "sam".to_string(),
            lifecycle: SessionLifecycle::Active,
            created_at,
            last_activity_at: created_at,
            topic: Some("fix the parser".to_string()),
            model: None,
            total_cost_usd: Some(1.25),
            task_done: 2,
            task_total: 5,
            pending_prompt: false,
            idle_warned: false,
        }
    }

    #[test]
    fn overview_is_deterministic_and_newest_first() {
        let now = Utc::now();
        let ctx = OverviewContext {
            version: "1.0.0",
            started_at: now - TimeDelta::minutes(90),
            max_sessions: 10,
        };
        let old = info("m:t1", now - TimeDelta::hours(2));
        let new = info("m:t2", now - TimeDelta::minutes(1));
        let a = render_overview(&MarkdownFormatter, &ctx, &[old.clone(), new.clone()], now);
        let b = render_overview(&MarkdownFormatter, &ctx, &[new, old], now);
        assert_eq!(a, b);
        assert!(a.contains("2/10 sessions"));
        assert!(a.contains("up 1h30m"));
        assert!(a.contains("📋 2/5"));
    }

    #[test]
    fn quiet_sessions_show_the_idle_bullet() {
        let now = Utc::now();
        let mut session = info("m:t1", now - TimeDelta::hours(1));
        session.last_activity_at = now - TimeDelta::minutes(10);
        assert_eq!(status_bullet(&session, now), "🌙");
        session.last_activity_at = now;
        assert_eq!(status_bullet(&session, now), "🟢");
    }

    #[test]
    fn empty_overview_invites_a_session() {
        let now = Utc::now();
        let ctx = OverviewContext {
            version: "1.0.0",
            started_at: now,
            max_sessions: 10,
        };
        let body = render_overview(&MarkdownFormatter, &ctx, &[], now);
        assert!(body.contains("No active sessions"));
    }
}
