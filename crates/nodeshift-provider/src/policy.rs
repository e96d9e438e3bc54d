//! Region eligibility and selection

use nodeshift_proto::{ProviderKind, Region};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashSet;

use crate::error::{ProviderError, ProviderResult};

/// Drop regions located in a disabled country (case-insensitive)
pub fn filter_regions(regions: Vec<Region>, disabled_countries: &HashSet<String>) -> Vec<Region> {
    if disabled_countries.is_empty() {
        return regions;
    }

    let disabled: HashSet<String> = disabled_countries
        .iter()
        .map(|c| c.to_ascii_uppercase())
        .collect();

    regions
        .into_iter()
        .filter(|r| !disabled.contains(&r.country.to_ascii_uppercase()))
        .collect()
}

/// Pick uniformly at random among eligible regions of `providers`
///
/// Candidates may pool the regions of several providers, giving every
/// eligible region the same chance. An empty candidate set is a policy
/// failure, never retried.
pub fn select_region<'a, T, R: Rng + ?Sized>(
    candidates: &'a [T],
    rng: &mut R,
    providers: &[ProviderKind],
) -> ProviderResult<&'a T> {
    candidates
        .choose(rng)
        .ok_or_else(|| ProviderError::NoEligibleRegion {
            providers: providers.to_vec(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashMap;

    fn disabled(codes: &[&str]) -> HashSet<String> {
        codes.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_disabled_country_is_excluded() {
        let regions = vec![Region::new("r1", "DE"), Region::new("r2", "NL")];

        let eligible = filter_regions(regions.clone(), &disabled(&["DE"]));
        assert_eq!(eligible, vec![Region::new("r2", "NL")]);

        let eligible = filter_regions(regions, &disabled(&["DE", "NL"]));
        assert!(eligible.is_empty());

        let mut rng = StdRng::seed_from_u64(7);
        let err = select_region(&eligible, &mut rng, &[ProviderKind::DigitalOcean]).unwrap_err();
        assert!(matches!(err, ProviderError::NoEligibleRegion { .. }));
        assert_eq!(err.to_string(), "No eligible region on digitalocean");
    }

    #[test]
    fn test_country_match_ignores_case() {
        let regions = vec![Region::new("fra1", "DE"), Region::new("ams3", "NL")];
        let eligible = filter_regions(regions, &disabled(&["de"]));
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, "ams3");
    }

    #[test]
    fn test_selection_is_roughly_uniform() {
        let regions = vec![
            Region::new("A", "US"),
            Region::new("B", "NL"),
            Region::new("C", "SG"),
        ];
        let mut rng = StdRng::seed_from_u64(42);
        let mut counts: HashMap<String, usize> = HashMap::new();

        for _ in 0..1000 {
            let region = select_region(&regions, &mut rng, &[ProviderKind::UpCloud]).unwrap();
            *counts.entry(region.id.clone()).or_default() += 1;
        }

        for id in ["A", "B", "C"] {
            let count = counts.get(id).copied().unwrap_or(0);
            assert!(count > 0, "region {} never selected", id);
            assert!(count <= 600, "region {} selected {} times", id, count);
        }
    }
}
