//! The caret stream: session lifecycle, color allocation, and idle reaping
//! (§4.2). Color math (`hsl_to_rgb`/`hue_to_rgb`) is carried over from this
//! codebase's existing cursor-rendering color generator; the allocation
//! policy that picks a *new* hue given the carets already live is new.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::delta::caret::{CaretDelta, CaretField, CaretFieldValue, CaretRecord};
use crate::error::BayouError;
use crate::storage::FileStore;

use super::{Change, Control, Snapshot, StreamKind};

pub struct CaretStreamKind;

impl StreamKind for CaretStreamKind {
    fn path_prefix() -> &'static str {
        "caret"
    }
}

/// Default idle threshold (§4.2): ten minutes of no update ends a session.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

const COLOR_SATURATION: f32 = 0.7;
const COLOR_LIGHTNESS: f32 = 0.6;
/// Candidates sampled when allocating a new caret's hue; finer than this
/// buys negligible extra spread for the caret counts a single document sees.
const HUE_CANDIDATES: u32 = 72;

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (hue_to_rgb(p, q, h + 1.0 / 3.0), hue_to_rgb(p, q, h), hue_to_rgb(p, q, h - 1.0 / 3.0))
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

fn rgb_to_hue(r: f32, g: f32, b: f32) -> f32 {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;
    if delta == 0.0 {
        // Grayscale colors have no hue; treated as 0 per the upstream
        // allocator's behavior, which can cluster grays with true reds.
        return 0.0;
    }
    let hue = if max == r {
        ((g - b) / delta).rem_euclid(6.0)
    } else if max == g {
        (b - r) / delta + 2.0
    } else {
        (r - g) / delta + 4.0
    };
    (hue * 60.0).rem_euclid(360.0)
}

fn hex_to_hue(hex: &str) -> f32 {
    let hex = hex.trim_start_matches('#');
    if hex.len() != 6 {
        return 0.0;
    }
    let parse = |s: &str| u8::from_str_radix(s, 16).unwrap_or(0) as f32 / 255.0;
    let r = parse(&hex[0..2]);
    let g = parse(&hex[2..4]);
    let b = parse(&hex[4..6]);
    rgb_to_hue(r, g, b)
}

fn hue_to_hex(hue_deg: f32) -> String {
    let (r, g, b) = hsl_to_rgb(hue_deg / 360.0, COLOR_SATURATION, COLOR_LIGHTNESS);
    format!("#{:02x}{:02x}{:02x}", (r * 255.0).round() as u8, (g * 255.0).round() as u8, (b * 255.0).round() as u8)
}

fn circular_distance(a: f32, b: f32) -> f32 {
    let d = (a - b).rem_euclid(360.0);
    d.min(360.0 - d)
}

/// Picks a hue maximizing the minimum circular distance to every already
/// assigned color (so new carets are maximally distinguishable), then
/// renders it at this allocator's fixed saturation/lightness (§4.2).
pub fn allocate_color(existing_colors: &[String]) -> String {
    if existing_colors.is_empty() {
        return hue_to_hex(0.0);
    }
    let existing_hues: Vec<f32> = existing_colors.iter().map(|c| hex_to_hue(c)).collect();
    let mut best_hue = 0.0_f32;
    let mut best_score = f32::MIN;
    for step in 0..HUE_CANDIDATES {
        let candidate = (step as f32) * 360.0 / HUE_CANDIDATES as f32;
        let score = existing_hues.iter().map(|h| circular_distance(candidate, *h)).fold(f32::MAX, f32::min);
        if score > best_score {
            best_score = score;
            best_hue = candidate;
        }
    }
    hue_to_hex(best_hue)
}

/// A live binding of `(authorId, caretId)` (§4.6, §GLOSSARY).
#[derive(Debug, Clone)]
pub struct Session {
    pub author_id: String,
    pub caret_id: String,
}

/// Revisioned log of caret deltas plus session lifecycle (§4.2).
pub struct CaretControl {
    inner: Control<CaretDelta>,
    last_seen_ms: StdMutex<HashMap<String, u64>>,
    idle_timeout: Duration,
}

impl CaretControl {
    pub fn new(store: Arc<dyn FileStore>, head: u64) -> Self {
        Self::with_idle_timeout(store, head, DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(store: Arc<dyn FileStore>, head: u64, idle_timeout: Duration) -> Self {
        Self {
            inner: Control::new(store, CaretStreamKind::path_prefix(), head),
            last_seen_ms: StdMutex::new(HashMap::new()),
            idle_timeout,
        }
    }

    pub fn current_rev_num(&self) -> u64 {
        self.inner.current_rev_num()
    }

    pub async fn get_snapshot(&self, rev: Option<u64>) -> Result<Snapshot<CaretDelta>, BayouError> {
        self.inner.get_snapshot(rev).await
    }

    pub async fn get_change_after(
        &self,
        base_rev: u64,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Change<CaretDelta>, BayouError> {
        self.inner.get_change_after(base_rev, timeout, cancel).await
    }

    fn touch(&self, caret_id: &str, now_ms: u64) {
        self.last_seen_ms.lock().unwrap().insert(caret_id.to_string(), now_ms);
    }

    fn forget(&self, caret_id: &str) {
        self.last_seen_ms.lock().unwrap().remove(caret_id);
    }

    /// Allocates a fresh caret for `author_id`, assigning a hue-spread color
    /// (§4.2) and appending a `beginSession` change.
    pub async fn make_new_session(
        &self,
        author_id: impl Into<String>,
        doc_rev: u64,
        now_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<Session, BayouError> {
        let author_id = author_id.into();
        let base_rev = self.current_rev_num();
        let base = self.get_snapshot(Some(base_rev)).await?;
        let table = base.contents.table().map_err(|e| BayouError::invariant_violation(e.to_string()))?;

        let mut caret_id = Uuid::new_v4().to_string();
        while table.contains_key(&caret_id) {
            caret_id = Uuid::new_v4().to_string();
        }
        let existing_colors: Vec<String> = table.values().map(|r| r.color.clone()).collect();
        let color = allocate_color(&existing_colors);

        let record = CaretRecord { author_id: author_id.clone(), doc_rev, index: 0, length: 0, color };
        let delta = CaretDelta::begin(caret_id.clone(), record);
        self.inner
            .apply_change::<CaretStreamKind>(base_rev, delta, Some(author_id.clone()), now_ms, cancel)
            .await?;
        self.touch(&caret_id, now_ms);
        Ok(Session { author_id, caret_id })
    }

    /// Validates that `(author_id, caret_id)` is currently live (§4.2).
    pub async fn find_existing_session(&self, author_id: &str, caret_id: &str) -> Result<Session, BayouError> {
        let snapshot = self.get_snapshot(None).await?;
        let table = snapshot.contents.table().map_err(|e| BayouError::invariant_violation(e.to_string()))?;
        match table.get(caret_id) {
            None => Err(BayouError::unknown_session(format!("no live caret {caret_id}"))),
            Some(record) if record.author_id != author_id => {
                Err(BayouError::wrong_author(format!("caret {caret_id} is bound to a different author")))
            }
            Some(_) => Ok(Session { author_id: author_id.to_string(), caret_id: caret_id.to_string() }),
        }
    }

    pub async fn update_caret(
        &self,
        caret_id: &str,
        author_id: &str,
        index: u64,
        length: u64,
        doc_rev: u64,
        now_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<Change<CaretDelta>, BayouError> {
        self.find_existing_session(author_id, caret_id).await?;
        let base_rev = self.current_rev_num();
        let delta = CaretDelta::set(caret_id, CaretField::Index, CaretFieldValue::Index(index))
            .compose(&CaretDelta::set(caret_id, CaretField::Length, CaretFieldValue::Length(length)))
            .and_then(|d| d.compose(&CaretDelta::set(caret_id, CaretField::DocRev, CaretFieldValue::DocRev(doc_rev))))
            .map_err(|e| BayouError::invariant_violation(e.to_string()))?;
        let result = self
            .inner
            .apply_change::<CaretStreamKind>(base_rev, delta, Some(author_id.to_string()), now_ms, cancel)
            .await?;
        self.touch(caret_id, now_ms);
        Ok(result)
    }

    pub async fn end_session(
        &self,
        caret_id: &str,
        author_id: &str,
        now_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<Change<CaretDelta>, BayouError> {
        self.find_existing_session(author_id, caret_id).await?;
        let base_rev = self.current_rev_num();
        let delta = CaretDelta::end(caret_id);
        let result = self
            .inner
            .apply_change::<CaretStreamKind>(base_rev, delta, Some(author_id.to_string()), now_ms, cancel)
            .await?;
        self.forget(caret_id);
        Ok(result)
    }

    /// Ends every caret whose last update is older than this control's idle
    /// threshold (§4.2, §8 Scenario F). Intended to be driven by a single
    /// cooperative task per document (§5).
    pub async fn reap_idle(&self, now_ms: u64, cancel: &CancellationToken) -> Result<Vec<String>, BayouError> {
        let stale: Vec<String> = {
            let last_seen = self.last_seen_ms.lock().unwrap();
            last_seen
                .iter()
                .filter(|(_, seen)| now_ms.saturating_sub(**seen) > self.idle_timeout.as_millis() as u64)
                .map(|(id, _)| id.clone())
                .collect()
        };
        let mut reaped = Vec::new();
        for caret_id in stale {
            let base_rev = self.current_rev_num();
            let snapshot = self.get_snapshot(Some(base_rev)).await?;
            let table = snapshot.contents.table().map_err(|e| BayouError::invariant_violation(e.to_string()))?;
            let Some(record) = table.get(&caret_id) else {
                self.forget(&caret_id);
                continue;
            };
            let author_id = record.author_id.clone();
            self.inner
                .apply_change::<CaretStreamKind>(base_rev, CaretDelta::end(&caret_id), Some(author_id), now_ms, cancel)
                .await?;
            self.forget(&caret_id);
            log::debug!("reaped idle caret {caret_id}");
            reaped.push(caret_id);
        }
        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_color_spreads_hues_apart() {
        let first = allocate_color(&[]);
        let second = allocate_color(&[first.clone()]);
        let first_hue = hex_to_hue(&first);
        let second_hue = hex_to_hue(&second);
        assert!(circular_distance(first_hue, second_hue) > 150.0, "second color should be roughly opposite the first");
    }

    #[test]
    fn grayscale_colors_are_treated_as_hue_zero() {
        assert_eq!(hex_to_hue("#808080"), 0.0);
    }
}
