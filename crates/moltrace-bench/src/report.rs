use std::path::Path;

use crate::runner::BenchmarkResult;

/// A complete baseline containing results from all scenes.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Baseline {
    pub timestamp: String,
    pub results: Vec<BenchmarkResult>,
}

/// Load a baseline from a JSON file. Returns None if the file doesn't exist.
pub fn load_baseline(path: &Path) -> Option<Baseline> {
    let contents = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&contents) {
        Ok(baseline) => Some(baseline),
        Err(e) => {
            log::warn!("Baseline {} is unreadable: {}", path.display(), e);
            None
        }
    }
}

/// Save a baseline to a JSON file.
pub fn save_baseline(path: &Path, baseline: &Baseline) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(baseline).map_err(std::io::Error::other)?;
    std::fs::write(path, json)
}

/// A scene whose mean update time grew past the threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct Regression {
    pub scene_name: String,
    pub baseline_ms: f64,
    pub current_ms: f64,
    pub pct_change: f64,
}

/// Compare current results against a baseline on mean update time.
/// Scenes missing from the baseline, or with a zero baseline, are skipped.
pub fn compare(
    current: &[BenchmarkResult],
    baseline: &Baseline,
    threshold_pct: f64,
) -> Vec<Regression> {
    let mut regressions = Vec::new();

    for result in current {
        let Some(base) = baseline
            .results
            .iter()
            .find(|b| b.scene_name == result.scene_name)
        else {
            continue;
        };
        if base.timings.mean_ms <= 0.0 {
            continue;
        }
        let pct_change =
            (result.timings.mean_ms - base.timings.mean_ms) / base.timings.mean_ms * 100.0;
        if pct_change > threshold_pct {
            regressions.push(Regression {
                scene_name: result.scene_name.clone(),
                baseline_ms: base.timings.mean_ms,
                current_ms: result.timings.mean_ms,
                pct_change,
            });
        }
    }

    regressions
}

/// Format results as markdown: update timings, then per-pass means and queries.
pub fn format_markdown(results: &[BenchmarkResult]) -> String {
    let mut out = String::new();
    out.push_str("| Scene | Atoms | Slots | Crashes | Mean (ms) | Median (ms) | P95 (ms) | P99 (ms) | Min (ms) | Max (ms) |\n");
    out.push_str("|-------|-------|-------|---------|-----------|-------------|----------|----------|----------|----------|\n");

    for r in results {
        out.push_str(&format!(
            "| {} | {} | {} | {} | {:.2} | {:.2} | {:.2} | {:.2} | {:.2} | {:.2} |\n",
            r.scene_name,
            r.atom_count,
            r.assigned_slots,
            r.crash_frames,
            r.timings.mean_ms,
            r.timings.median_ms,
            r.timings.p95_ms,
            r.timings.p99_ms,
            r.timings.min_ms,
            r.timings.max_ms,
        ));
    }

    out.push('\n');
    out.push_str("| Scene | Upload | Remove | Insert | Schedule | Size | Allocate | Scatter | CPU query (ms) | GPU query (ms) |\n");
    out.push_str("|-------|--------|--------|--------|----------|------|----------|---------|----------------|----------------|\n");

    for r in results {
        let p = &r.passes;
        let gpu = r
            .gpu_query
            .as_ref()
            .map_or_else(|| "-".to_string(), |t| format!("{:.2}", t.mean_ms));
        out.push_str(&format!(
            "| {} | {:.3} | {:.3} | {:.3} | {:.3} | {:.3} | {:.3} | {:.3} | {:.2} | {} |\n",
            r.scene_name,
            p.upload_ms,
            p.remove_ms,
            p.insert_ms,
            p.schedule_ms,
            p.size_ms,
            p.allocate_ms,
            p.scatter_ms,
            r.cpu_query.mean_ms,
            gpu,
        ));
    }

    out
}

/// Format a comparison report showing regressions.
pub fn format_comparison(regressions: &[Regression], threshold_pct: f64) -> String {
    if regressions.is_empty() {
        return format!(
            "All scenes within {:.0}% threshold. No regressions detected.\n",
            threshold_pct
        );
    }

    let mut out = String::new();
    out.push_str(&format!(
        "REGRESSIONS DETECTED (>{:.0}% threshold):\n",
        threshold_pct
    ));
    for r in regressions {
        out.push_str(&format!(
            "  - {}: {:.2}ms -> {:.2}ms (+{:.1}%)\n",
            r.scene_name, r.baseline_ms, r.current_ms, r.pct_change
        ));
    }
    out
}
