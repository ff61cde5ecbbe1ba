//! Binary balancing tree with one leaf per rank.
//!
//! Each internal node splits its box along one axis so that the work on
//! either side is proportional to the number of ranks below it. Leaf `k`
//! is the domain of rank `k`, and the leaves tile the root box.

use search::DomainBox;

use crate::error::DomainError;

/// A position carrying a work estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadSample<const D: usize> {
    /// Position
    pub r: [f32; D],
    /// Work at this position
    pub work: f32,
}

#[derive(Debug, Clone)]
struct TreeNode<const D: usize> {
    bbox: DomainBox<D>,
    level: u32,
    first_rank: usize,
    nranks: usize,
    children: Option<(usize, usize)>,
    split_axis: usize,
    split_value: f32,
}

/// Domain decomposition tree, held by the coordinator.
#[derive(Debug, Clone)]
pub struct BalancingTree<const D: usize> {
    nodes: Vec<TreeNode<D>>,
    finite: DomainBox<D>,
}

impl<const D: usize> BalancingTree<D> {
    /// Build the tree structure for `nranks` leaves below `root`. Splits are
    /// placed by [`BalancingTree::load`]; until then every internal node
    /// splits its box at the midpoint of the `finite` extent.
    pub fn build(
        root: DomainBox<D>,
        finite: DomainBox<D>,
        nranks: usize,
    ) -> Result<Self, DomainError> {
        if nranks == 0 {
            return Err(DomainError::Config("balancing tree needs at least one rank".to_string()));
        }
        if root.is_degenerate() || finite.is_degenerate() {
            return Err(DomainError::Config(format!(
                "balancing tree root box is degenerate: {:?}",
                root
            )));
        }

        let mut tree = Self {
            nodes: Vec::with_capacity(2 * nranks - 1),
            finite,
        };
        tree.create_node(root, 0, 0, nranks);
        tree.split_node(0, &mut []);
        Ok(tree)
    }

    fn create_node(&mut self, bbox: DomainBox<D>, level: u32, first_rank: usize, nranks: usize) -> usize {
        let index = self.nodes.len();
        self.nodes.push(TreeNode {
            bbox,
            level,
            first_rank,
            nranks,
            children: None,
            split_axis: 0,
            split_value: 0.0,
        });
        if nranks > 1 {
            let nleft = nranks / 2;
            let left = self.create_node(bbox, level + 1, first_rank, nleft);
            let right = self.create_node(bbox, level + 1, first_rank + nleft, nranks - nleft);
            self.nodes[index].children = Some((left, right));
        }
        index
    }

    /// Number of leaves (ranks).
    pub fn nranks(&self) -> usize {
        self.nodes[0].nranks
    }

    /// Depth of the deepest leaf.
    pub fn depth(&self) -> u32 {
        self.nodes.iter().map(|n| n.level).max().unwrap_or(0)
    }

    /// Place every split so that each side carries its share of the work.
    pub fn load(&mut self, samples: &mut [LoadSample<D>]) {
        self.split_node(0, samples);
    }

    /// Re-split the shallowest subtrees whose left/right work deviates from
    /// the target share by more than `threshold` (relative to the subtree's
    /// work). Returns the shallowest level that changed.
    pub fn rebalance(&mut self, samples: &mut [LoadSample<D>], threshold: f32) -> Option<u32> {
        let mut adjusted = None;
        self.rebalance_node(0, samples, threshold, &mut adjusted);
        adjusted
    }

    fn rebalance_node(
        &mut self,
        index: usize,
        samples: &mut [LoadSample<D>],
        threshold: f32,
        adjusted: &mut Option<u32>,
    ) {
        let node = &self.nodes[index];
        let Some((left, right)) = node.children else {
            return;
        };

        let total: f32 = samples.iter().map(|s| s.work).sum();
        if total <= 0.0 {
            return;
        }

        let (axis, split) = (node.split_axis, node.split_value);
        let nleft = partition(samples, axis, split);
        let left_work: f32 = samples[..nleft].iter().map(|s| s.work).sum();
        let target = total * self.nodes[left].nranks as f32 / node.nranks as f32;

        if (left_work - target).abs() / total > threshold {
            let level = self.nodes[index].level;
            tracing::debug!(
                "Node at level {} off balance ({:.3} of target {:.3}), re-splitting",
                level,
                left_work,
                target
            );
            self.split_node(index, samples);
            *adjusted = Some(adjusted.map_or(level, |l: u32| l.min(level)));
        } else {
            let (lower, upper) = samples.split_at_mut(nleft);
            self.rebalance_node(left, lower, threshold, adjusted);
            self.rebalance_node(right, upper, threshold, adjusted);
        }
    }

    /// Recompute the split of `index` and every node below it from `samples`.
    fn split_node(&mut self, index: usize, samples: &mut [LoadSample<D>]) {
        let Some((left, right)) = self.nodes[index].children else {
            return;
        };
        let bbox = self.nodes[index].bbox;
        let axis = self.widest_axis(&bbox, samples);

        let mut split = if samples.len() < 2 {
            // Nothing to balance
            self.midpoint(&bbox, axis)
        } else {
            let share = self.nodes[left].nranks as f32 / self.nodes[index].nranks as f32;
            weighted_split(samples, axis, share)
        };
        if !(split > bbox.boxmin[axis] && split < bbox.boxmax[axis]) {
            split = self.midpoint(&bbox, axis);
        }

        let mut lower = bbox;
        let mut upper = bbox;
        lower.boxmax[axis] = split;
        upper.boxmin[axis] = split;

        let node = &mut self.nodes[index];
        node.split_axis = axis;
        node.split_value = split;
        self.nodes[left].bbox = lower;
        self.nodes[right].bbox = upper;

        let nleft = partition(samples, axis, split);
        let (below, above) = samples.split_at_mut(nleft);
        self.split_node(left, below);
        self.split_node(right, above);
    }

    /// Axis of largest sample spread, or of largest finite box extent when
    /// the samples do not spread.
    fn widest_axis(&self, bbox: &DomainBox<D>, samples: &[LoadSample<D>]) -> usize {
        let mut best = (0, 0.0_f32);
        if samples.len() >= 2 {
            for k in 0..D {
                let (lo, hi) = samples.iter().fold((f32::MAX, f32::MIN), |(lo, hi), s| {
                    (lo.min(s.r[k]), hi.max(s.r[k]))
                });
                if hi - lo > best.1 {
                    best = (k, hi - lo);
                }
            }
            if best.1 > 0.0 {
                return best.0;
            }
        }
        for k in 0..D {
            let (lo, hi) = self.finite_range(bbox, k);
            if hi - lo > best.1 {
                best = (k, hi - lo);
            }
        }
        best.0
    }

    /// Extent of `bbox` along `k`, clipped to the finite simulation box when
    /// they overlap.
    fn finite_range(&self, bbox: &DomainBox<D>, k: usize) -> (f32, f32) {
        let lo = bbox.boxmin[k].max(self.finite.boxmin[k]);
        let hi = bbox.boxmax[k].min(self.finite.boxmax[k]);
        if lo < hi {
            (lo, hi)
        } else {
            (bbox.boxmin[k], bbox.boxmax[k])
        }
    }

    fn midpoint(&self, bbox: &DomainBox<D>, k: usize) -> f32 {
        let (lo, hi) = self.finite_range(bbox, k);
        0.5 * (lo + hi)
    }

    /// Domain box of every rank, indexed by rank.
    pub fn leaf_boxes(&self) -> Vec<DomainBox<D>> {
        let mut boxes = vec![self.nodes[0].bbox; self.nranks()];
        for node in self.nodes.iter().filter(|n| n.children.is_none()) {
            boxes[node.first_rank] = node.bbox;
        }
        boxes
    }
}

/// Position along `axis` leaving `share` of the total work below it.
/// Samples are reordered; `samples.len() >= 2`.
fn weighted_split<const D: usize>(samples: &mut [LoadSample<D>], axis: usize, share: f32) -> f32 {
    samples.sort_by(|a, b| a.r[axis].total_cmp(&b.r[axis]));

    let total: f32 = samples.iter().map(|s| s.work).sum();
    let n = samples.len();
    let mut nbelow = if total > 0.0 {
        let target = share * total;
        let mut cumulative = 0.0;
        samples
            .iter()
            .position(|s| {
                cumulative += s.work;
                cumulative >= target
            })
            .map_or(n - 1, |i| i + 1)
    } else {
        (share * n as f32).round() as usize
    };
    nbelow = nbelow.clamp(1, n - 1);

    0.5 * (samples[nbelow - 1].r[axis] + samples[nbelow].r[axis])
}

/// Move samples below `split` along `axis` to the front; returns their count.
fn partition<const D: usize>(samples: &mut [LoadSample<D>], axis: usize, split: f32) -> usize {
    let mut nbelow = 0;
    for i in 0..samples.len() {
        if samples[i].r[axis] < split {
            samples.swap(i, nbelow);
            nbelow += 1;
        }
    }
    nbelow
}
