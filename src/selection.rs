//! Parent selection for the SELECT_PARENT step.

use rand::seq::{index, SliceRandom};
use rand::Rng;

use crate::archive::{Archive, ProgramId};
use crate::error::ArchiveError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPolicy {
    /// Always the current leader.
    Best,
    /// Uniformly from the top `k`.
    HallOfFame { k: usize },
    /// Uniformly from every stored program, ranked or not.
    Uniform,
    /// Best of `size` ranked programs drawn at random.
    Tournament { size: usize },
}

impl SelectionPolicy {
    /// Parse `best`, `hall_of_fame`, `uniform` or `tournament:<size>`.
    pub fn parse(s: &str, hof_k: usize) -> Option<Self> {
        let s = s.trim().to_lowercase();
        match s.as_str() {
            "best" | "elitist" => Some(SelectionPolicy::Best),
            "hall_of_fame" | "hof" => Some(SelectionPolicy::HallOfFame { k: hof_k.max(1) }),
            "uniform" | "random" => Some(SelectionPolicy::Uniform),
            _ => {
                let size = s.strip_prefix("tournament:")?.parse::<usize>().ok()?;
                (size > 0).then_some(SelectionPolicy::Tournament { size })
            }
        }
    }
}

/// Pick a parent id, or `None` when the archive is empty.
///
/// Ranked policies fall back to uniform selection while nothing has a score
/// for `metric` yet, so an unevaluated root can still be evolved.
pub fn select_parent<R: Rng + ?Sized>(
    archive: &Archive,
    policy: SelectionPolicy,
    metric: &str,
    rng: &mut R,
) -> Result<Option<ProgramId>, ArchiveError> {
    let ranked = match policy {
        SelectionPolicy::Uniform => return uniform(archive, rng),
        SelectionPolicy::Best => archive.top(metric, 1)?,
        SelectionPolicy::HallOfFame { k } => archive.top(metric, k.max(1))?,
        SelectionPolicy::Tournament { .. } => archive.top(metric, usize::MAX)?,
    };
    if ranked.is_empty() {
        return uniform(archive, rng);
    }

    let picked = match policy {
        SelectionPolicy::Tournament { size } => {
            // hall of fame is already sorted, so the smallest index wins
            let winner = index::sample(rng, ranked.len(), size.clamp(1, ranked.len()))
                .into_iter()
                .min()
                .unwrap_or(0);
            ranked[winner].program.id
        }
        _ => match ranked.choose(rng) {
            Some(entry) => entry.program.id,
            None => return Ok(None),
        },
    };
    Ok(Some(picked))
}

fn uniform<R: Rng + ?Sized>(archive: &Archive, rng: &mut R) -> Result<Option<ProgramId>, ArchiveError> {
    Ok(archive.ids()?.choose(rng).copied())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn scored(archive: &Archive, text: &str, score: f64) -> ProgramId {
        let id = archive.insert(text, None).unwrap();
        let scores: BTreeMap<String, f64> = [("calmar".to_string(), score)].into_iter().collect();
        archive.record_evaluation(id, &scores).unwrap();
        id
    }

    #[test]
    fn test_parse() {
        assert_eq!(SelectionPolicy::parse("best", 5), Some(SelectionPolicy::Best));
        assert_eq!(SelectionPolicy::parse("HOF", 3), Some(SelectionPolicy::HallOfFame { k: 3 }));
        assert_eq!(SelectionPolicy::parse("uniform", 5), Some(SelectionPolicy::Uniform));
        assert_eq!(
            SelectionPolicy::parse("tournament:3", 5),
            Some(SelectionPolicy::Tournament { size: 3 })
        );
        assert_eq!(SelectionPolicy::parse("tournament:0", 5), None);
        assert_eq!(SelectionPolicy::parse("tournament:x", 5), None);
        assert_eq!(SelectionPolicy::parse("roulette", 5), None);
    }

    #[test]
    fn test_empty_archive_selects_nothing() {
        let dir = TempDir::new().unwrap();
        let archive = Archive::open(dir.path().join("a.db")).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        for policy in [
            SelectionPolicy::Best,
            SelectionPolicy::HallOfFame { k: 3 },
            SelectionPolicy::Uniform,
            SelectionPolicy::Tournament { size: 2 },
        ] {
            assert_eq!(select_parent(&archive, policy, "calmar", &mut rng).unwrap(), None);
        }
    }

    #[test]
    fn test_best_picks_leader() {
        let dir = TempDir::new().unwrap();
        let archive = Archive::open(dir.path().join("a.db")).unwrap();
        scored(&archive, "a", 0.1);
        let leader = scored(&archive, "b", 2.0);
        scored(&archive, "c", 1.0);
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..5 {
            let picked = select_parent(&archive, SelectionPolicy::Best, "calmar", &mut rng).unwrap();
            assert_eq!(picked, Some(leader));
        }
    }

    #[test]
    fn test_hall_of_fame_stays_in_top_k() {
        let dir = TempDir::new().unwrap();
        let archive = Archive::open(dir.path().join("a.db")).unwrap();
        let low = scored(&archive, "a", -1.0);
        scored(&archive, "b", 2.0);
        scored(&archive, "c", 1.0);
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..50 {
            let picked = select_parent(&archive, SelectionPolicy::HallOfFame { k: 2 }, "calmar", &mut rng)
                .unwrap()
                .unwrap();
            assert_ne!(picked, low);
        }
    }

    #[test]
    fn test_full_tournament_is_elitist() {
        let dir = TempDir::new().unwrap();
        let archive = Archive::open(dir.path().join("a.db")).unwrap();
        scored(&archive, "a", 0.5);
        let leader = scored(&archive, "b", 0.9);
        let mut rng = StdRng::seed_from_u64(11);
        let picked = select_parent(&archive, SelectionPolicy::Tournament { size: 10 }, "calmar", &mut rng).unwrap();
        assert_eq!(picked, Some(leader));
    }

    #[test]
    fn test_unranked_archive_falls_back_to_population() {
        let dir = TempDir::new().unwrap();
        let archive = Archive::open(dir.path().join("a.db")).unwrap();
        let root = archive.insert("root", None).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let picked = select_parent(&archive, SelectionPolicy::Best, "calmar", &mut rng).unwrap();
        assert_eq!(picked, Some(root));
    }
}
