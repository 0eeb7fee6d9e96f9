//! Hoop geometry. Hoop times are sample indices into the snippet, whose crossing sample
//! sits at the pre-trigger index.

use neuro_types::{HoopDefinition, SpikeClass, UnitHoops, MAX_UNITS};

pub type HoopTable = [UnitHoops; MAX_UNITS];

/// Whether the snippet passes through `hoop`. Inactive hoops always pass.
pub fn intersects(hoop: &HoopDefinition, snippet: &[f32]) -> bool {
    if !hoop.is_active() {
        return true;
    }
    let t_a = hoop.t_a as usize;
    let t_b = hoop.t_b as usize;
    if hoop.is_vertical() {
        let Some(&v) = snippet.get(t_a) else {
            return false;
        };
        let (lo, hi) = if hoop.y_a < hoop.y_b {
            (hoop.y_a, hoop.y_b)
        } else {
            (hoop.y_b, hoop.y_a)
        };
        return lo < v && v < hi;
    }

    let slope = (hoop.y_b - hoop.y_a) / (t_b - t_a) as f32;
    let edge = |t: usize| hoop.y_a + slope * (t - t_a) as f32;
    let end = t_b.min(snippet.len().saturating_sub(1));
    (t_a..end).any(|t| {
        let d0 = snippet[t] - edge(t);
        let d1 = snippet[t + 1] - edge(t + 1);
        (d0 <= 0.0 && d1 > 0.0) || (d0 >= 0.0 && d1 < 0.0)
    })
}

/// A unit matches when it has at least one active hoop and the snippet passes all of them.
pub fn unit_matches(hoops: &UnitHoops, snippet: &[f32]) -> bool {
    hoops.iter().any(HoopDefinition::is_active) && hoops.iter().all(|h| intersects(h, snippet))
}

pub fn classify(
    snippet: &[f32],
    max_amplitude: f32,
    use_hoops: bool,
    units: &HoopTable,
) -> SpikeClass {
    if snippet.iter().any(|v| v.abs() > max_amplitude) {
        return SpikeClass::Artifact;
    }
    if !use_hoops {
        return SpikeClass::Unclassified;
    }
    units
        .iter()
        .position(|unit| unit_matches(unit, snippet))
        .map_or(SpikeClass::Unclassified, |u| SpikeClass::Unit(u as u8))
}

#[cfg(test)]
mod tests {
    use super::*;
    use neuro_types::MAX_HOOPS_PER_UNIT;

    const SNIPPET: [f32; 8] = [0.0, -5.0, 10.0, -30.0, -60.0, -20.0, 15.0, 5.0];

    fn unit_with(hoop: HoopDefinition) -> UnitHoops {
        let mut unit = [HoopDefinition::INACTIVE; MAX_HOOPS_PER_UNIT];
        unit[0] = hoop;
        unit
    }

    #[test]
    fn vertical_hoop_is_strict() {
        assert!(intersects(&HoopDefinition::new(3, -50.0, 3, -10.0), &SNIPPET));
        assert!(intersects(&HoopDefinition::new(3, -10.0, 3, -50.0), &SNIPPET));
        assert!(!intersects(&HoopDefinition::new(3, -30.0, 3, -10.0), &SNIPPET));
        assert!(!intersects(&HoopDefinition::new(4, -50.0, 4, -10.0), &SNIPPET));
        assert!(!intersects(&HoopDefinition::new(20, -50.0, 20, 50.0), &SNIPPET));
    }

    #[test]
    fn sloped_hoop_needs_a_sign_change() {
        // Edge at t=2..4 is 0, -20, -40: sample minus edge goes 10, -10, -20.
        assert!(intersects(&HoopDefinition::new(2, 0.0, 4, -40.0), &SNIPPET));
        // Edge well below the trace: differences stay positive.
        assert!(!intersects(&HoopDefinition::new(1, -100.0, 3, -90.0), &SNIPPET));
        // Touching the edge exactly then leaving counts.
        assert!(intersects(&HoopDefinition::new(5, -20.0, 6, -20.0), &SNIPPET));
    }

    #[test]
    fn sloped_hoop_is_clipped_to_snippet() {
        assert!(!intersects(&HoopDefinition::new(7, 0.0, 30, 10.0), &SNIPPET));
    }

    #[test]
    fn inactive_hoops_pass_but_empty_units_do_not_match() {
        assert!(intersects(&HoopDefinition::INACTIVE, &SNIPPET));
        let empty = [HoopDefinition::INACTIVE; MAX_HOOPS_PER_UNIT];
        assert!(!unit_matches(&empty, &SNIPPET));
    }

    #[test]
    fn classification_order() {
        let mut table = [[HoopDefinition::INACTIVE; MAX_HOOPS_PER_UNIT]; MAX_UNITS];
        assert_eq!(classify(&SNIPPET, 1000.0, false, &table), SpikeClass::Unclassified);
        assert_eq!(classify(&SNIPPET, 1000.0, true, &table), SpikeClass::Unclassified);

        table[1] = unit_with(HoopDefinition::new(3, -50.0, 3, -10.0));
        table[2] = unit_with(HoopDefinition::new(4, -70.0, 4, -50.0));
        assert_eq!(classify(&SNIPPET, 1000.0, true, &table), SpikeClass::Unit(1));
        assert_eq!(classify(&SNIPPET, 1000.0, false, &table), SpikeClass::Unclassified);
        assert_eq!(classify(&SNIPPET, 50.0, true, &table), SpikeClass::Artifact);
    }
}
