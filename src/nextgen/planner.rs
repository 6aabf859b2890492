// =============================================================================
// Next-test planner — coverage gaps into a prioritized test plan
// =============================================================================
//
// Uses hit-count matrices to find coverage gaps in the regions that matter
// most: the knock-sensitive high-MAP midrange, idle stability cells, and
// the tip-in transition band. The plan is human-readable guidance for the
// operator, never machine control commands.
// =============================================================================

use serde::Serialize;

use crate::nextgen::cause_tree::{CauseTreeResult, HypothesisCategory};
use crate::nextgen::surfaces::Surface2D;

/// Hits below this per cell count as a gap.
const GAP_HIT_THRESHOLD: u64 = 3;

/// A named high-impact grid region.
#[derive(Debug, Clone, Serialize)]
pub struct CoverageGap {
    pub region: String,
    pub rpm_range: (f64, f64),
    pub map_range: (f64, f64),
    pub empty_cells: usize,
    pub total_cells: usize,
    /// Lower number = higher priority.
    pub priority: u8,
}

/// One recommended test.
#[derive(Debug, Clone, Serialize)]
pub struct TestStep {
    pub name: String,
    pub goal: String,
    pub rpm_range: (f64, f64),
    pub map_range: (f64, f64),
    pub priority: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct NextTestPlan {
    pub steps: Vec<TestStep>,
    pub gaps: Vec<CoverageGap>,
}

struct Region {
    name: &'static str,
    rpm: (f64, f64),
    map: (f64, f64),
    priority: u8,
    goal: &'static str,
}

/// High-impact regions, checked in priority order.
const REGIONS: &[Region] = &[
    Region {
        name: "high-MAP midrange",
        rpm: (3000.0, 5500.0),
        map: (80.0, 100.0),
        priority: 1,
        goal: "cover the torque peak where knock sensitivity is highest",
    },
    Region {
        name: "idle and low MAP",
        rpm: (1000.0, 2000.0),
        map: (20.0, 40.0),
        priority: 2,
        goal: "stabilize idle cells and verify sensor quality at low flow",
    },
    Region {
        name: "tip-in transition band",
        rpm: (2500.0, 4500.0),
        map: (40.0, 70.0),
        priority: 3,
        goal: "characterize transient fueling through the transition cells",
    },
];

/// Scan the hit-count surface for under-covered cells in each region.
pub fn identify_coverage_gaps(hit_surface: &Surface2D) -> Vec<CoverageGap> {
    let mut gaps = Vec::new();
    for region in REGIONS {
        let mut empty = 0usize;
        let mut total = 0usize;
        for (ri, rpm) in hit_surface.rpm_axis.iter().enumerate() {
            if *rpm < region.rpm.0 || *rpm > region.rpm.1 {
                continue;
            }
            for (mi, map) in hit_surface.map_axis.iter().enumerate() {
                if *map < region.map.0 || *map > region.map.1 {
                    continue;
                }
                total += 1;
                if hit_surface.hit_count[ri][mi] < GAP_HIT_THRESHOLD {
                    empty += 1;
                }
            }
        }
        if total > 0 && empty > 0 {
            gaps.push(CoverageGap {
                region: region.name.to_string(),
                rpm_range: region.rpm,
                map_range: region.map,
                empty_cells: empty,
                total_cells: total,
                priority: region.priority,
            });
        }
    }
    gaps.sort_by_key(|g| g.priority);
    gaps
}

/// Turn the gaps and the cause tree into an ordered test plan.
pub fn generate_test_plan(hit_surface: &Surface2D, cause_tree: &CauseTreeResult) -> NextTestPlan {
    let gaps = identify_coverage_gaps(hit_surface);
    let mut steps = Vec::new();

    for gap in &gaps {
        let region = REGIONS
            .iter()
            .find(|r| r.name == gap.region)
            .expect("gap regions come from the region table");
        steps.push(TestStep {
            name: format!("fill {}", gap.region),
            goal: format!(
                "{} ({} of {} cells under-covered)",
                region.goal, gap.empty_cells, gap.total_cells
            ),
            rpm_range: gap.rpm_range,
            map_range: gap.map_range,
            priority: gap.priority,
        });
    }

    // Hypotheses append targeted follow-ups after the coverage work.
    for hypothesis in &cause_tree.hypotheses {
        let step = match hypothesis.category {
            HypothesisCategory::KnockLimit => Some(TestStep {
                name: "knock verification sweep".to_string(),
                goal: "repeat the WOT sweep logging per-cylinder knock counts".to_string(),
                rpm_range: (3000.0, 6000.0),
                map_range: (90.0, 100.0),
                priority: 4,
            }),
            HypothesisCategory::Transient => Some(TestStep {
                name: "steady-state cell capture".to_string(),
                goal: "hold steady cells so the fuel model sees no wall-wetting bias"
                    .to_string(),
                rpm_range: (2000.0, 5000.0),
                map_range: (40.0, 80.0),
                priority: 5,
            }),
            HypothesisCategory::TempTrim => Some(TestStep {
                name: "cool-down discipline".to_string(),
                goal: "re-run the last sweep after IAT returns to ambient".to_string(),
                rpm_range: (1000.0, 6500.0),
                map_range: (20.0, 100.0),
                priority: 6,
            }),
            HypothesisCategory::FuelModel | HypothesisCategory::DataQuality => None,
        };
        if let Some(step) = step {
            if !steps.iter().any(|s| s.name == step.name) {
                steps.push(step);
            }
        }
    }

    steps.sort_by_key(|s| s.priority);
    NextTestPlan { steps, gaps }
}
