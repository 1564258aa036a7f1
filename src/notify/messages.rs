//! User-facing message templates

use chrono::SecondsFormat;

use crate::domain::{Tier, TokenSnapshot};
use crate::monitor::classifier::Spike;

/// Group an amount with thousands separators: `1234567.891, 2` -> `1,234,567.89`
pub fn group_thousands(value: f64, decimals: usize) -> String {
    let formatted = format!("{:.*}", decimals, value.abs());
    let (int_part, frac_part) = match formatted.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (formatted.as_str(), None),
    };

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    let sign = if value < 0.0 && formatted.chars().any(|c| c.is_ascii_digit() && c != '0') {
        "-"
    } else {
        ""
    };
    match frac_part {
        Some(frac) => format!("{}{}.{}", sign, grouped, frac),
        None => format!("{}{}", sign, grouped),
    }
}

/// `solana` -> `Solana`
pub fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Escape characters that legacy Markdown would treat as markup
pub fn escape_markdown(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        if matches!(ch, '_' | '*' | '`' | '[') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn money(value: Option<f64>, decimals: usize) -> String {
    match value {
        Some(v) if v.is_finite() => format!("${}", group_thousands(v, decimals)),
        _ => "N/A".to_string(),
    }
}

fn percent(value: Option<f64>) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{:.2}%", v),
        _ => "N/A".to_string(),
    }
}

/// Body shared by both spike templates
fn spike_body(snapshot: &TokenSnapshot) -> String {
    format!(
        "📢 [{symbol}](https://dexscreener.com/{chain}/{address}) is spiking!\n\
         `{address}`\n\n\
         💰 Market Cap: {mcap}\n\
         💹 5m Change: {pct}\n\
         📈 5m Volume: {volume}\n\
         🕓 Timestamps: {ts}",
        symbol = escape_markdown(&snapshot.symbol),
        chain = snapshot.chain_id,
        address = snapshot.address,
        mcap = money(snapshot.market_cap, 0),
        pct = percent(snapshot.price_change_m5),
        volume = money(snapshot.volume_m5, 2),
        ts = snapshot.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
    )
}

/// Alert text for one spike decision; `None` for `Spike::None`
pub fn spike_message(snapshot: &TokenSnapshot, spike: Spike) -> Option<String> {
    let (header, footer) = match spike {
        Spike::None => return None,
        Spike::First { minutes } => (
            format!("🚀 First spike detected in the last {} minutes!", minutes),
            "\n\n👀 *Keep eyes peeled: early spike detected!*",
        ),
        Spike::Ongoing { minutes } => (
            format!("📈 Ongoing spike sustained over {} minutes!", minutes),
            "",
        ),
    };

    Some(format!(
        "{}\n\n🔗 Chain: {}\n\n{}{}",
        header,
        capitalize(&snapshot.chain_id),
        spike_body(snapshot),
        footer
    ))
}

/// Copy of a user alert for the spike-log chat
pub fn admin_log_message(display_name: &str, alert_text: &str) -> String {
    format!("🔔 [User Alert from {}]\n\n{}", display_name, alert_text)
}

/// Error-log entry for a failed delivery
pub fn delivery_failure_message(chat_id: i64, error: &str) -> String {
    format!("❌ [Fallback] Failed to send message to {}: {}", chat_id, error)
}

pub fn monitoring_reminder_message() -> String {
    "👀 Your tokens are actively monitored. No spike alerts yet. Stay tuned!".to_string()
}

pub fn expiry_reminder_message(tier: Tier, days: i64) -> String {
    format!(
        "⚠️ Your {} tier will expire in {} day{}. Kindly renew your tier using /renew to keep your current benefits.",
        tier.display_name(),
        days,
        if days == 1 { "" } else { "s" }
    )
}

pub fn expiry_today_message(tier: Tier) -> String {
    format!(
        "🔔 Your {} tier will expire today. You have a 3-day grace period before being automatically *downgraded* to Apprentice tier.",
        tier.display_name()
    )
}

pub fn trim_notice_message(tier: Tier, limit: usize) -> String {
    format!(
        "🚫 Your tracked tokens exceeded your tier limit ({}). They have been trimmed to the first {} token(s).",
        tier.display_name(),
        limit
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn snapshot() -> TokenSnapshot {
        TokenSnapshot {
            timestamp: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
            address: "EKpQGSJtjMFqKZ9KQanSqYXRcF8fBopzLHYxdM65zcjm".into(),
            symbol: "$WIF".into(),
            chain_id: "solana".into(),
            price_change_m5: Some(12.0),
            volume_m5: Some(45_678.9),
            market_cap: Some(1_234_567.8),
        }
    }

    #[test]
    fn test_group_thousands() {
        assert_eq!(group_thousands(1_234_567.891, 2), "1,234,567.89");
        assert_eq!(group_thousands(999.0, 0), "999");
        assert_eq!(group_thousands(1000.0, 0), "1,000");
        assert_eq!(group_thousands(0.0, 2), "0.00");
        assert_eq!(group_thousands(-12_345.0, 0), "-12,345");
    }

    #[test]
    fn test_first_spike_message() {
        let text = spike_message(&snapshot(), Spike::First { minutes: 5 }).unwrap();
        assert!(text.starts_with("🚀 First spike detected in the last 5 minutes!"));
        assert!(text.contains("🔗 Chain: Solana"));
        assert!(text.contains("https://dexscreener.com/solana/EKpQ"));
        assert!(text.contains("💰 Market Cap: $1,234,568"));
        assert!(text.contains("💹 5m Change: 12.00%"));
        assert!(text.contains("📈 5m Volume: $45,678.90"));
        assert!(text.contains("2025-03-01T12:00:00Z"));
        assert!(text.contains("Keep eyes peeled"));
    }

    #[test]
    fn test_ongoing_spike_message() {
        let text = spike_message(&snapshot(), Spike::Ongoing { minutes: 15 }).unwrap();
        assert!(text.starts_with("📈 Ongoing spike sustained over 15 minutes!"));
        assert!(!text.contains("Keep eyes peeled"));
        assert!(spike_message(&snapshot(), Spike::None).is_none());
    }

    #[test]
    fn test_missing_fields_render_na() {
        let mut s = snapshot();
        s.market_cap = None;
        s.volume_m5 = None;
        let text = spike_message(&s, Spike::First { minutes: 5 }).unwrap();
        assert!(text.contains("💰 Market Cap: N/A"));
        assert!(text.contains("📈 5m Volume: N/A"));
    }

    #[test]
    fn test_tier_messages() {
        assert!(expiry_reminder_message(Tier::Chieftain, 1).contains("Chieftain tier will expire in 1 day."));
        assert!(expiry_reminder_message(Tier::Disciple, 3).contains("in 3 days"));
        assert!(expiry_today_message(Tier::Overlord).contains("3-day grace period"));
        assert!(trim_notice_message(Tier::Apprentice, 3).contains("first 3 token(s)"));
    }

    #[test]
    fn test_escape_markdown() {
        assert_eq!(escape_markdown("MY_TOKEN*"), "MY\\_TOKEN\\*");
        assert_eq!(capitalize("ethereum"), "Ethereum");
        assert_eq!(capitalize(""), "");
    }
}
