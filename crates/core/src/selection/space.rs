use forkloop_shared::{ForkConfig, ParameterAssignment};

use super::types::Axis;

/// Lazy traversal of the Cartesian product of `axes`.
///
/// Order is stable for a given axis ordering: the last axis varies fastest.
/// An empty axis list, or any axis without values, yields nothing.
#[must_use]
pub fn generate(axes: &[Axis]) -> ConfigSpace<'_> {
    let exhausted = axes.is_empty() || axes.iter().any(|a| a.values.is_empty());
    ConfigSpace {
        axes,
        cursor: vec![0; axes.len()],
        emitted: 0,
        exhausted,
    }
}

/// Number of candidates `generate(axes)` will yield.
#[must_use]
pub fn space_size(axes: &[Axis]) -> usize {
    if axes.is_empty() {
        return 0;
    }
    axes.iter()
        .map(|a| a.values.len())
        .try_fold(1usize, usize::checked_mul)
        .unwrap_or(usize::MAX)
}

pub struct ConfigSpace<'a> {
    axes: &'a [Axis],
    cursor: Vec<usize>,
    emitted: usize,
    exhausted: bool,
}

impl ConfigSpace<'_> {
    /// Odometer increment; marks the space exhausted after the last combination.
    fn advance(&mut self) {
        for pos in (0..self.cursor.len()).rev() {
            self.cursor[pos] += 1;
            if self.cursor[pos] < self.axes[pos].values.len() {
                return;
            }
            self.cursor[pos] = 0;
        }
        self.exhausted = true;
    }
}

impl Iterator for ConfigSpace<'_> {
    type Item = ForkConfig;

    fn next(&mut self) -> Option<ForkConfig> {
        if self.exhausted {
            return None;
        }

        let assignment: ParameterAssignment = self
            .axes
            .iter()
            .zip(&self.cursor)
            .map(|(axis, &idx)| (axis.name.clone(), axis.values[idx].clone()))
            .collect();
        let config = ForkConfig::new(format!("fork-{:04}", self.emitted), assignment);

        self.emitted += 1;
        self.advance();
        Some(config)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.exhausted {
            return (0, Some(0));
        }
        let remaining = space_size(self.axes).saturating_sub(self.emitted);
        (remaining, Some(remaining))
    }
}
