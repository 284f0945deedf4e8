use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{Result, RouterError};

/// One artifact discovered under the models directory, following the
/// `<user>/<repo>/<quant>.<ext>` layout. Identity is `full_name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedModel {
    pub user: String,
    pub repo: String,
    pub quant: String,
    pub full_name: String,
    pub path: PathBuf,
}

/// Outcome of a resolve attempt.
pub enum Resolution {
    Unique(DownloadedModel),
    Ambiguous(Vec<DownloadedModel>),
    NotFound { suggestions: Vec<DownloadedModel> },
}

const QUANT_RANK_ORDER: &[&str] = &[
    "Q4_K_M", "Q4_K_S", "Q5_K_M", "Q5_K_S", "Q5_0", "Q5_1", "Q6_K", "Q8_0", "Q3_K_M", "Q3_K_S",
    "Q3_K_L", "Q2_K", "Q4_0", "Q4_1", "FP16", "F16", "FP32", "F32",
];

fn quant_rank(quant: &str) -> usize {
    let upper = quant.to_uppercase();
    QUANT_RANK_ORDER
        .iter()
        .position(|q| *q == upper)
        .unwrap_or(QUANT_RANK_ORDER.len())
}

fn best_quant(models: Vec<DownloadedModel>) -> DownloadedModel {
    models
        .into_iter()
        .min_by_key(|m| quant_rank(&m.quant))
        .expect("best_quant called with empty slice")
}

/// Walks `root` looking for `<user>/<repo>/<quant>.<ext>` files. A path
/// that doesn't fit that three-level shape is ignored, not an error.
pub fn scan(root: &Path) -> Result<Vec<DownloadedModel>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in WalkDir::new(root).into_iter() {
        let entry = entry.map_err(|e| RouterError::Internal(anyhow::anyhow!(e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let rel = match path.strip_prefix(root) {
            Ok(r) => r,
            Err(_) => continue,
        };
        let parts: Vec<_> = rel.components().collect();
        if parts.len() != 3 {
            continue;
        }
        let user = parts[0].as_os_str().to_string_lossy().to_string();
        let repo = parts[1].as_os_str().to_string_lossy().to_string();
        let quant = match path.file_stem() {
            Some(s) => s.to_string_lossy().to_string(),
            None => continue,
        };
        let full_name = format!("{user}/{repo}:{quant}");
        out.push(DownloadedModel {
            user,
            repo,
            quant,
            full_name,
            path: path.to_path_buf(),
        });
    }
    Ok(out)
}

/// Resolve `query` against a snapshot of downloaded models, in strict
/// priority order: exact full name, exact repo, suffix, contains, fuzzy.
pub fn resolve(query: &str, models: &[DownloadedModel]) -> Resolution {
    let q = query.trim();
    let q_lower = q.to_lowercase();

    if let Some(m) = models.iter().find(|m| m.full_name.to_lowercase() == q_lower) {
        return Resolution::Unique(m.clone());
    }

    if !q.contains(':') {
        let hits: Vec<_> = models
            .iter()
            .filter(|m| format!("{}/{}", m.user, m.repo).to_lowercase() == q_lower)
            .cloned()
            .collect();
        if hits.len() == 1 {
            return Resolution::Unique(hits.into_iter().next().unwrap());
        }
        if hits.len() > 1 {
            return Resolution::Unique(best_quant(hits));
        }
    }

    let suffix_hits: Vec<_> = models
        .iter()
        .filter(|m| {
            let repo_quant = format!("{}:{}", m.repo, m.quant).to_lowercase();
            m.repo.to_lowercase() == q_lower || repo_quant == q_lower
        })
        .cloned()
        .collect();
    if !suffix_hits.is_empty() {
        return finish_grouped(suffix_hits);
    }

    let contains_hits: Vec<_> = models
        .iter()
        .filter(|m| m.full_name.to_lowercase().contains(&q_lower))
        .cloned()
        .collect();
    if !contains_hits.is_empty() {
        return finish_grouped(contains_hits);
    }

    let threshold = q.chars().count() / 2 + 3;
    let mut scored: Vec<(usize, &DownloadedModel)> = models
        .iter()
        .map(|m| {
            let by_full = levenshtein(&q_lower, &m.full_name.to_lowercase());
            let by_repo = levenshtein(&q_lower, &m.repo.to_lowercase());
            (by_full.min(by_repo), m)
        })
        .filter(|(d, _)| *d <= threshold)
        .collect();
    scored.sort_by_key(|(d, _)| *d);
    let suggestions = scored
        .into_iter()
        .take(3)
        .map(|(_, m)| m.clone())
        .collect();
    Resolution::NotFound { suggestions }
}

fn finish_grouped(hits: Vec<DownloadedModel>) -> Resolution {
    let all_same_repo = hits.windows(2).all(|w| w[0].user == w[1].user && w[0].repo == w[1].repo);
    if all_same_repo {
        Resolution::Unique(best_quant(hits))
    } else {
        Resolution::Ambiguous(hits)
    }
}

/// Classic edit-distance, O(n*m), operating on Unicode scalar values.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (n, m) = (a.len(), b.len());
    let mut prev: Vec<usize> = (0..=m).collect();
    let mut cur = vec![0usize; m + 1];
    for i in 1..=n {
        cur[0] = i;
        for j in 1..=m {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            cur[j] = (prev[j] + 1).min(cur[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[m]
}
