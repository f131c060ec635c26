// src/dashboard/page.rs
//! Server-rendered HTML for `GET /`. Every value from the store goes through
//! `html_escape` before it lands in the page.

use html_escape::{encode_double_quoted_attribute as attr, encode_text as text};
use std::fmt::Write as _;

use crate::store::{ColorToken, Signal};

use super::{SignalQuery, Snapshot};

const PAGE_ROWS: usize = 300;

const STYLE: &str = "body{font-family:-apple-system,Segoe UI,sans-serif;margin:2rem;color:#222}\
table{border-collapse:collapse;width:100%}td,th{padding:.3rem .5rem;border-bottom:1px solid #eee;\
text-align:left;vertical-align:top}.muted{color:#888}.chips span{margin-right:1rem}\
form input,form select{margin-right:.5rem}";

pub fn render(snap: &Snapshot, q: &SignalQuery, rows: &[&Signal]) -> String {
    let mut out = String::with_capacity(16 * 1024);
    out.push_str("<!doctype html><html><head><meta charset=\"utf-8\"><title>Signal Atlas</title>");
    let _ = write!(out, "<style>{STYLE}</style></head><body><h1>Signal Atlas</h1>");

    if snap.rows.is_empty() {
        out.push_str("<p class=\"muted\">No data. Run <code>atlas fetch</code> and <code>atlas score</code> first.</p>");
        out.push_str("</body></html>");
        return out;
    }

    let _ = write!(
        out,
        "<p class=\"muted\">{} signals, {} unscored, loaded {}</p>",
        snap.status.total,
        snap.status.unscored,
        text(&snap.loaded_at_rfc3339)
    );
    render_filters(&mut out, snap, q);
    render_color_counts(&mut out, rows);

    if rows.is_empty() {
        out.push_str("<p class=\"muted\">No signals match these filters.</p>");
    } else {
        render_table(&mut out, &rows[..rows.len().min(PAGE_ROWS)]);
    }
    out.push_str("</body></html>");
    out
}

fn render_filters(out: &mut String, snap: &Snapshot, q: &SignalQuery) {
    out.push_str("<form method=\"get\" action=\"/\">");

    out.push_str("<select name=\"source\"><option value=\"\">all sources</option>");
    for s in &snap.sources {
        let selected = if q.source.as_deref() == Some(s.as_str()) { " selected" } else { "" };
        let _ = write!(out, "<option value=\"{}\"{selected}>{}</option>", attr(s), text(s));
    }
    out.push_str("</select>");

    out.push_str("<select name=\"color\"><option value=\"\">all colors</option>");
    let wanted = q.color.as_deref().and_then(ColorToken::parse);
    for c in ColorToken::ALL {
        let selected = if wanted == Some(c) { " selected" } else { "" };
        let _ = write!(
            out,
            "<option value=\"{}\"{selected}>{} {}</option>",
            c.name(),
            c.symbol(),
            c.name()
        );
    }
    out.push_str("</select>");

    let _ = write!(
        out,
        "<input type=\"search\" name=\"q\" placeholder=\"search\" value=\"{}\">",
        attr(q.q.as_deref().unwrap_or_default())
    );
    out.push_str("<button type=\"submit\">Filter</button></form>");
}

fn render_color_counts(out: &mut String, rows: &[&Signal]) {
    out.push_str("<p class=\"chips\">");
    for c in ColorToken::ALL {
        let n = rows.iter().filter(|r| r.color_token() == Some(c)).count();
        let _ = write!(out, "<span>{} {n}</span>", c.symbol());
    }
    let unscored = rows.iter().filter(|r| r.color_token().is_none()).count();
    let _ = write!(out, "<span class=\"muted\">unscored {unscored}</span></p>");
}

fn render_table(out: &mut String, rows: &[&Signal]) {
    out.push_str("<table><thead><tr><th></th><th>score</th><th>time</th><th>source</th><th>title</th></tr></thead><tbody>");
    for r in rows {
        let title = r
            .title
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| r.display_text());
        let url = r.url.as_deref().unwrap_or_default();
        let score = r.score.map(|s| format!("{s:.2}")).unwrap_or_default();
        let when = r
            .published_at()
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        let title_cell = if url.starts_with("http://") || url.starts_with("https://") {
            format!("<a href=\"{}\">{}</a>", attr(url), text(title))
        } else {
            text(title).to_string()
        };
        let _ = write!(
            out,
            "<tr><td>{}</td><td>{score}</td><td>{when}</td><td class=\"muted\">{}</td><td>{title_cell}",
            r.color_token().map(ColorToken::symbol).unwrap_or(""),
            text(r.source.as_deref().unwrap_or_default()),
        );
        if let Some(rat) = r.rationale.as_deref().filter(|s| !s.is_empty()) {
            let _ = write!(out, "<br><small class=\"muted\">{}</small>", text(rat));
        }
        out.push_str("</td></tr>");
    }
    out.push_str("</tbody></table>");
}
