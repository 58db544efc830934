// Startup banner printed once boot finishes.

use crate::boot::BootReport;
use crate::errors::hash_prefix;
use crate::fingerprint::SystemFingerprint;

const WIDTH: usize = 72;

fn rule(left: char, right: char) -> String {
    format!("{left}{}{right}", "═".repeat(WIDTH - 2))
}

fn row(text: &str) -> String {
    let inner = WIDTH - 4;
    let clipped: String = text.chars().take(inner).collect();
    let pad = inner - clipped.chars().count();
    format!("║ {clipped}{} ║", " ".repeat(pad))
}

/// Render the banner for `report`.
pub fn render(report: &BootReport, fingerprint: &SystemFingerprint) -> String {
    let mut lines = vec![
        rule('╔', '╗'),
        row(&format!("{} {}  runtime gatekeeper", fingerprint.package, fingerprint.version)),
        rule('╠', '╣'),
        row("RUNTIME"),
        row(&format!("  mode            {}", report.mode)),
        row(&format!("  hardened        {}", report.hardened)),
        row(&format!("  correlation id  {}", report.correlation_id)),
    ];
    if let Some(parent) = &report.parent_correlation_id {
        lines.push(row(&format!("  parent id       {parent}")));
    }
    match &report.sealed {
        Some(sealed) => {
            lines.push(row(&format!("  sealed labels   {}", sealed.labels)));
            lines.push(row(&format!("  digest          {}...", hash_prefix(&sealed.digest))));
            lines.push(row(&format!("  composite       {}...", hash_prefix(&sealed.composite_digest))));
            lines.push(row(&format!("  sealed at       {}", sealed.sealed_on)));
        }
        None => lines.push(row("  sealing         skipped (reduced-trust mode)")),
    }
    if let Some(self_hash) = &report.self_hash {
        lines.push(row(&format!("  self-hash       {}", self_hash.label())));
    }
    if let Some(signatures) = &report.signatures {
        lines.push(row(&format!(
            "  signatures      {} verified, {} failed, {} unsigned",
            signatures.verified.len(),
            signatures.failed.len(),
            signatures.unsigned.len()
        )));
    }
    lines.push(row(&format!("  patrol threads  {}", report.patrol_threads)));
    lines.push(row(&format!("  boot time       {:.3} ms", report.elapsed.as_secs_f64() * 1000.0)));

    lines.push(rule('╠', '╣'));
    lines.push(row("SYSTEM"));
    lines.push(row(&format!("  host            {}", fingerprint.hostname)));
    lines.push(row(&format!("  user            {}", fingerprint.user)));
    lines.push(row(&format!("  platform        {} / {}", fingerprint.os, fingerprint.arch)));
    lines.push(row(&format!("  cpus            {}", fingerprint.cpu_count)));
    lines.push(row(&format!("  executable      {}", fingerprint.interpreter_path)));
    lines.push(row(&format!("  fingerprint     {}...", hash_prefix(&fingerprint.digest()))));

    if report.trusted_hash_in_use {
        lines.push(rule('╠', '╣'));
        lines.push(row("WARNING: trusted override hash in use."));
        lines.push(row("Release hash validation is relaxed; do not use in production."));
    }
    lines.push(rule('╚', '╝'));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_have_fixed_width() {
        let line = row("short");
        assert_eq!(line.chars().count(), WIDTH);
        let long = row(&"x".repeat(200));
        assert_eq!(long.chars().count(), WIDTH);
        assert_eq!(rule('╔', '╗').chars().count(), WIDTH);
    }
}
