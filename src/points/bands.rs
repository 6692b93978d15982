//! Banded points-pool distribution.
//!
//! Splits a week's activity points pool across participants: filter out
//! accounts under the minimum, trim the bottom percentile, group the rest
//! into contiguous bands ascending by raw points, weight each band's pool
//! share geometrically, and split a band's share equally among its members.

use uuid::Uuid;

use crate::config::CampaignSettings;

/// Seam for the per-activity pool allocation rules. `participants` are
/// `(user, raw points)` pairs; the result is each awarded user's share of
/// `pool`. Users filtered out by the rules receive no entry.
pub trait PointsDistribution {
    fn distribute(&self, participants: Vec<(Uuid, f64)>, pool: f64) -> Vec<(Uuid, f64)>;
}

/// The campaign's banded distribution rules.
#[derive(Debug, Clone)]
pub struct BandedDistribution {
    pub minimum_points: f64,
    pub lower_bounds_percentage: f64,
    pub number_of_bands: usize,
    pub pool_share_start: f64,
    pub pool_share_step: f64,
}

impl BandedDistribution {
    pub fn from_settings(campaign: &CampaignSettings) -> Self {
        Self {
            minimum_points: campaign.minimum_points,
            lower_bounds_percentage: campaign.lower_bounds_percentage,
            number_of_bands: campaign.number_of_bands,
            pool_share_start: campaign.pool_share_start,
            pool_share_step: campaign.pool_share_step,
        }
    }

    /// Contiguous index ranges splitting `len` participants into up to
    /// `bands` groups, lowest scores first. Bands may be empty when there
    /// are fewer participants than bands.
    fn band_bounds(len: usize, bands: usize) -> Vec<(usize, usize)> {
        let bands = bands.max(1);
        (0..bands)
            .map(|i| (i * len / bands, (i + 1) * len / bands))
            .collect()
    }
}

impl PointsDistribution for BandedDistribution {
    fn distribute(&self, mut participants: Vec<(Uuid, f64)>, pool: f64) -> Vec<(Uuid, f64)> {
        if pool <= 0.0 {
            return vec![];
        }

        participants.retain(|(_, points)| *points >= self.minimum_points);
        participants.sort_by(|a, b| a.1.total_cmp(&b.1));

        let trimmed = (participants.len() as f64 * self.lower_bounds_percentage).floor() as usize;
        let kept = participants.split_off(trimmed.min(participants.len()));
        if kept.is_empty() {
            return vec![];
        }

        let bounds = Self::band_bounds(kept.len(), self.number_of_bands);

        // Geometric band weights, normalized over non-empty bands only so
        // the whole pool is always awarded.
        let weights: Vec<f64> = bounds
            .iter()
            .enumerate()
            .map(|(i, (start, end))| {
                if end > start {
                    self.pool_share_start * self.pool_share_step.powi(i as i32)
                } else {
                    0.0
                }
            })
            .collect();
        let total_weight: f64 = weights.iter().sum();
        if total_weight <= 0.0 {
            return vec![];
        }

        let mut awarded = Vec::with_capacity(kept.len());
        for (i, (start, end)) in bounds.iter().enumerate() {
            if end <= start {
                continue;
            }
            let band_pool = pool * weights[i] / total_weight;
            let per_user = band_pool / (end - start) as f64;
            for (user_id, _) in &kept[*start..*end] {
                awarded.push((*user_id, per_user));
            }
        }
        awarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> BandedDistribution {
        BandedDistribution {
            minimum_points: 100.0,
            lower_bounds_percentage: 0.1,
            number_of_bands: 4,
            pool_share_start: 0.98,
            pool_share_step: 1.15,
        }
    }

    fn users(points: &[f64]) -> Vec<(Uuid, f64)> {
        points.iter().map(|p| (Uuid::new_v4(), *p)).collect()
    }

    #[test]
    fn test_distributes_whole_pool() {
        let awarded = rules().distribute(users(&[150.0, 200.0, 300.0, 400.0, 500.0]), 10_000.0);
        let total: f64 = awarded.iter().map(|(_, p)| p).sum();
        assert!((total - 10_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_filters_below_minimum() {
        let mut participants = users(&[50.0, 99.9]);
        let qualified = (Uuid::new_v4(), 150.0);
        participants.push(qualified);

        let awarded = rules().distribute(participants, 1_000.0);
        assert_eq!(awarded.len(), 1);
        assert_eq!(awarded[0].0, qualified.0);
        assert!((awarded[0].1 - 1_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_trims_bottom_percentile() {
        // 10 qualified users with 10% trim: the lowest one is dropped
        let participants = users(&[
            110.0, 120.0, 130.0, 140.0, 150.0, 160.0, 170.0, 180.0, 190.0, 200.0,
        ]);
        let lowest = participants
            .iter()
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .unwrap()
            .0;

        let awarded = rules().distribute(participants, 1_000.0);
        assert_eq!(awarded.len(), 9);
        assert!(awarded.iter().all(|(id, _)| *id != lowest));
    }

    #[test]
    fn test_higher_band_gets_larger_pool_share() {
        // 8 users over 4 bands of 2: per-user share must grow band over band
        let participants = users(&[
            110.0, 120.0, 210.0, 220.0, 310.0, 320.0, 410.0, 420.0,
        ]);
        let mut rules = rules();
        rules.lower_bounds_percentage = 0.0;

        let mut awarded = rules.distribute(participants, 1_000.0);
        awarded.sort_by(|a, b| a.1.total_cmp(&b.1));

        // Band members share equally, and each band beats the one below it
        assert!((awarded[0].1 - awarded[1].1).abs() < 1e-9);
        assert!(awarded[2].1 > awarded[1].1);
        assert!(awarded[4].1 > awarded[3].1);
        assert!(awarded[6].1 > awarded[5].1);
    }

    #[test]
    fn test_fewer_users_than_bands_still_awards_whole_pool() {
        let mut rules = rules();
        rules.lower_bounds_percentage = 0.0;
        let awarded = rules.distribute(users(&[150.0, 250.0]), 500.0);

        assert_eq!(awarded.len(), 2);
        let total: f64 = awarded.iter().map(|(_, p)| p).sum();
        assert!((total - 500.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_inputs() {
        assert!(rules().distribute(vec![], 1_000.0).is_empty());
        assert!(rules().distribute(users(&[500.0]), 0.0).is_empty());
    }
}
