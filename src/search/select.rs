//! Parent selection: elitism plus inverse-distance weighted exploration.
//!
//! The top-K candidates by aggregate divergence always survive into the
//! parent pool. A smaller exploration slice is then drawn from the remainder
//! by weighted random sampling with weight 1/(distance + floor), so weak but
//! not hopeless candidates occasionally breed and the population doesn't
//! collapse onto one basin early.

use rand::prelude::*;

use crate::template::Template;

/// Avoids infinite weight for a (near-)zero-divergence candidate.
const WEIGHT_FLOOR: f64 = 1e-3;

/// Select the parent pool from evaluated candidates.
///
/// `candidates` pairs each live template with its aggregate divergence
/// (failed candidates are filtered out before this point). Returns up to
/// `elite_k + explore_k` templates, elites first, best first.
pub fn select_parents(
    candidates: &[(Template, f64)],
    elite_k: usize,
    explore_k: usize,
    rng: &mut StdRng,
) -> Vec<Template> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let mut ranked: Vec<&(Template, f64)> = candidates.iter().collect();
    ranked.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

    let elite_k = elite_k.max(1).min(ranked.len());
    let mut parents: Vec<Template> = ranked[..elite_k].iter().map(|(t, _)| t.clone()).collect();

    // Exploration slice from the non-elite remainder
    let mut rest: Vec<&(Template, f64)> = ranked[elite_k..].to_vec();
    for _ in 0..explore_k {
        if rest.is_empty() {
            break;
        }
        let weights: Vec<f64> = rest.iter().map(|(_, d)| 1.0 / (d + WEIGHT_FLOOR)).collect();
        let total: f64 = weights.iter().sum();
        let mut pick = rng.gen::<f64>() * total;

        let mut chosen = rest.len() - 1;
        for (i, w) in weights.iter().enumerate() {
            pick -= w;
            if pick <= 0.0 {
                chosen = i;
                break;
            }
        }
        parents.push(rest.remove(chosen).0.clone());
    }

    parents
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::seed_template;

    fn candidate(id: &str, distance: f64) -> (Template, f64) {
        let mut t = seed_template();
        t.id = id.to_string();
        (t, distance)
    }

    #[test]
    fn test_elites_are_best() {
        let mut rng = StdRng::seed_from_u64(1);
        let candidates = vec![
            candidate("mediocre", 0.5),
            candidate("best", 0.1),
            candidate("worst", 0.9),
            candidate("good", 0.2),
        ];

        let parents = select_parents(&candidates, 2, 0, &mut rng);
        assert_eq!(parents.len(), 2);
        assert_eq!(parents[0].id, "best");
        assert_eq!(parents[1].id, "good");
    }

    #[test]
    fn test_exploration_draws_from_non_elites() {
        let mut rng = StdRng::seed_from_u64(2);
        let candidates = vec![
            candidate("best", 0.1),
            candidate("b", 0.4),
            candidate("c", 0.5),
            candidate("d", 0.6),
        ];

        let parents = select_parents(&candidates, 1, 2, &mut rng);
        assert_eq!(parents.len(), 3);
        assert_eq!(parents[0].id, "best");
        // The exploration picks are distinct non-elites
        assert_ne!(parents[1].id, "best");
        assert_ne!(parents[2].id, "best");
        assert_ne!(parents[1].id, parents[2].id);
    }

    #[test]
    fn test_exploration_prefers_lower_distance() {
        // Statistically: with weight 1/d, a 0.1-distance candidate should be
        // drawn far more often than a 10.0-distance one.
        let candidates = vec![
            candidate("elite", 0.01),
            candidate("near", 0.1),
            candidate("far", 10.0),
        ];

        let mut near_wins = 0;
        for seed in 0..200 {
            let mut rng = StdRng::seed_from_u64(seed);
            let parents = select_parents(&candidates, 1, 1, &mut rng);
            if parents[1].id == "near" {
                near_wins += 1;
            }
        }
        assert!(
            near_wins > 150,
            "inverse-distance weighting should favor 'near' ({}/200)",
            near_wins
        );
    }

    #[test]
    fn test_degenerate_inputs() {
        let mut rng = StdRng::seed_from_u64(3);
        assert!(select_parents(&[], 2, 1, &mut rng).is_empty());

        let one = vec![candidate("only", 0.3)];
        let parents = select_parents(&one, 3, 3, &mut rng);
        assert_eq!(parents.len(), 1);
    }
}
