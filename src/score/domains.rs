//! # Domain Weights
//!
//! Maps the host of a signal's URL to a prior in `[0.0, 1.0]` describing how
//! much a hit from that site is usually worth.
//!
//! - Built-in seed of known high-signal sites, extended/overridden from config.
//! - Case-insensitive; a leading `www.` is ignored.
//! - Subdomains match their parent (`blog.github.com` → `github.com`).
//! - Unknown host → `default_weight`; URL without a host → `unparsable_weight`.

use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct DomainWeights {
    pub default_weight: f32,
    pub unparsable_weight: f32,
    pub weights: HashMap<String, f32>,
}

impl Default for DomainWeights {
    fn default() -> Self {
        Self::default_seed()
    }
}

impl DomainWeights {
    /// Seed plus overrides; override keys are normalized the same way as lookups.
    pub fn with_overrides(overrides: &HashMap<String, f32>) -> Self {
        let mut me = Self::default_seed();
        for (k, &v) in overrides {
            me.weights.insert(normalize_host(k), clamp01(v));
        }
        me
    }

    /// Built-in seed used when nothing is configured.
    pub fn default_seed() -> Self {
        let mut weights = HashMap::new();
        for (k, v) in [
            ("openai.com", 0.78),
            ("blog.cloudflare.com", 0.72),
            ("schneier.com", 0.70),
            ("lwn.net", 0.68),
            ("arstechnica.com", 0.65),
            ("github.com", 0.62),
            ("theverge.com", 0.58),
        ] {
            weights.insert(k.to_string(), v);
        }
        Self {
            default_weight: 0.45,
            unparsable_weight: 0.40,
            weights,
        }
    }

    /// Weight for a full URL.
    pub fn weight_for_url(&self, url: &str) -> f32 {
        match reqwest::Url::parse(url.trim())
            .ok()
            .and_then(|u| u.host_str().map(normalize_host))
        {
            Some(host) => self.weight_for_host(&host),
            None => clamp01(self.unparsable_weight),
        }
    }

    pub fn weight_for_host(&self, host: &str) -> f32 {
        let host = normalize_host(host);

        // Exact match first so a configured subdomain wins over its parent.
        if let Some(&w) = self.weights.get(&host) {
            return clamp01(w);
        }

        // Longest matching parent domain.
        self.weights
            .iter()
            .filter(|(d, _)| host.ends_with(&format!(".{d}")))
            .max_by_key(|(d, _)| d.len())
            .map(|(_, &w)| clamp01(w))
            .unwrap_or_else(|| clamp01(self.default_weight))
    }
}

fn normalize_host(h: &str) -> String {
    let h = h.trim().trim_end_matches('.').to_ascii_lowercase();
    h.strip_prefix("www.").map(str::to_string).unwrap_or(h)
}

fn clamp01(x: f32) -> f32 {
    x.clamp(0.0, 1.0)
}
