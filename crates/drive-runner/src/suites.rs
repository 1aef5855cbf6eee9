//! Benchmark suites known to the driver. The set is closed: a drive
//! condition names one of [`SuiteId`]'s variants and is resolved here, never
//! by loading code by name.

use anyhow::{anyhow, Result};

pub type WeatherId = u32;

/// One (task, weather) cell of a suite: every pose is driven once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Experiment {
    pub task_name: String,
    pub weather: WeatherId,
    pub poses: Vec<[u32; 2]>,
    pub vehicles: u32,
    pub pedestrians: u32,
}

/// Distinct task names of a suite in first-appearance order. Fixed for the
/// lifetime of a run; its order is the column order of every summary.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TaskList(Vec<String>);

impl TaskList {
    pub fn new(names: Vec<String>) -> Self {
        let mut unique: Vec<String> = Vec::with_capacity(names.len());
        for name in names {
            if !unique.contains(&name) {
                unique.push(name);
            }
        }
        Self(unique)
    }

    pub fn from_experiments(experiments: &[Experiment]) -> Self {
        Self::new(experiments.iter().map(|e| e.task_name.clone()).collect())
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Task whose summary log decides which checkpoints are evaluated.
    pub fn reference(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.0.iter().enumerate().map(|(i, s)| (i, s.as_str()))
    }
}

pub trait BenchmarkSuite {
    fn id(&self) -> SuiteId;

    fn weathers(&self) -> Vec<WeatherId>;

    fn build_experiments(&self) -> Vec<Experiment>;

    fn task_list(&self) -> TaskList {
        TaskList::from_experiments(&self.build_experiments())
    }

    /// Episodes driven per (task, weather) cell.
    fn episodes_per_condition(&self) -> usize {
        self.build_experiments()
            .first()
            .map(|e| e.poses.len())
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuiteId {
    TestSuite,
    CorlTraining,
    CorlNewWeather,
    EccvTraining,
    EccvGeneralization,
    NocrashTraining,
    NocrashNewWeather,
}

impl SuiteId {
    pub const ALL: [SuiteId; 7] = [
        SuiteId::TestSuite,
        SuiteId::CorlTraining,
        SuiteId::CorlNewWeather,
        SuiteId::EccvTraining,
        SuiteId::EccvGeneralization,
        SuiteId::NocrashTraining,
        SuiteId::NocrashNewWeather,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SuiteId::TestSuite => "TestSuite",
            SuiteId::CorlTraining => "CorlTraining",
            SuiteId::CorlNewWeather => "CorlNewWeather",
            SuiteId::EccvTraining => "ECCVTrainingSuite",
            SuiteId::EccvGeneralization => "ECCVGeneralizationSuite",
            SuiteId::NocrashTraining => "NocrashTraining",
            SuiteId::NocrashNewWeather => "NocrashNewWeather",
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|id| id.name() == name)
            .ok_or_else(|| {
                anyhow!(
                    "unknown_suite: '{}' (known: {})",
                    name,
                    Self::ALL
                        .iter()
                        .map(|id| id.name())
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            })
    }

    pub fn build(self) -> Box<dyn BenchmarkSuite> {
        match self {
            SuiteId::TestSuite => Box::new(TestSuite),
            SuiteId::CorlTraining => Box::new(CorlSuite { new_weather: false }),
            SuiteId::CorlNewWeather => Box::new(CorlSuite { new_weather: true }),
            SuiteId::EccvTraining => Box::new(EccvSuite { generalization: false }),
            SuiteId::EccvGeneralization => Box::new(EccvSuite { generalization: true }),
            SuiteId::NocrashTraining => Box::new(NocrashSuite { new_weather: false }),
            SuiteId::NocrashNewWeather => Box::new(NocrashSuite { new_weather: true }),
        }
    }
}

impl std::fmt::Display for SuiteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

const TRAINING_WEATHERS: [WeatherId; 4] = [1, 3, 6, 8];
const NEW_WEATHERS: [WeatherId; 2] = [10, 14];

struct TaskDef {
    name: &'static str,
    poses: &'static [[u32; 2]],
    vehicles: u32,
    pedestrians: u32,
}

fn expand(weathers: &[WeatherId], tasks: &[TaskDef]) -> Vec<Experiment> {
    let mut experiments = Vec::with_capacity(weathers.len() * tasks.len());
    for &weather in weathers {
        for task in tasks {
            experiments.push(Experiment {
                task_name: task.name.to_string(),
                weather,
                poses: task.poses.to_vec(),
                vehicles: task.vehicles,
                pedestrians: task.pedestrians,
            });
        }
    }
    experiments
}

struct TestSuite;

impl BenchmarkSuite for TestSuite {
    fn id(&self) -> SuiteId {
        SuiteId::TestSuite
    }

    fn weathers(&self) -> Vec<WeatherId> {
        vec![1]
    }

    fn build_experiments(&self) -> Vec<Experiment> {
        expand(
            &self.weathers(),
            &[TaskDef {
                name: "straight",
                poses: &[[36, 40], [39, 35]],
                vehicles: 0,
                pedestrians: 0,
            }],
        )
    }
}

const CORL_STRAIGHT: [[u32; 2]; 4] = [[36, 40], [39, 35], [110, 114], [7, 3]];
const CORL_ONE_CURVE: [[u32; 2]; 4] = [[138, 17], [47, 16], [26, 9], [42, 49]];
const CORL_NAVIGATION: [[u32; 2]; 4] = [[105, 29], [27, 130], [102, 87], [132, 27]];

struct CorlSuite {
    new_weather: bool,
}

impl BenchmarkSuite for CorlSuite {
    fn id(&self) -> SuiteId {
        if self.new_weather {
            SuiteId::CorlNewWeather
        } else {
            SuiteId::CorlTraining
        }
    }

    fn weathers(&self) -> Vec<WeatherId> {
        if self.new_weather {
            NEW_WEATHERS.to_vec()
        } else {
            TRAINING_WEATHERS.to_vec()
        }
    }

    fn build_experiments(&self) -> Vec<Experiment> {
        expand(
            &self.weathers(),
            &[
                TaskDef {
                    name: "straight",
                    poses: &CORL_STRAIGHT,
                    vehicles: 0,
                    pedestrians: 0,
                },
                TaskDef {
                    name: "one_curve",
                    poses: &CORL_ONE_CURVE,
                    vehicles: 0,
                    pedestrians: 0,
                },
                TaskDef {
                    name: "navigation",
                    poses: &CORL_NAVIGATION,
                    vehicles: 0,
                    pedestrians: 0,
                },
                TaskDef {
                    name: "navigation_dynamic",
                    poses: &CORL_NAVIGATION,
                    vehicles: 20,
                    pedestrians: 50,
                },
            ],
        )
    }
}

const ECCV_POSES: [[u32; 2]; 4] = [[105, 29], [27, 130], [102, 87], [132, 27]];

struct EccvSuite {
    generalization: bool,
}

impl BenchmarkSuite for EccvSuite {
    fn id(&self) -> SuiteId {
        if self.generalization {
            SuiteId::EccvGeneralization
        } else {
            SuiteId::EccvTraining
        }
    }

    fn weathers(&self) -> Vec<WeatherId> {
        if self.generalization {
            NEW_WEATHERS.to_vec()
        } else {
            TRAINING_WEATHERS.to_vec()
        }
    }

    fn build_experiments(&self) -> Vec<Experiment> {
        expand(
            &self.weathers(),
            &[
                TaskDef {
                    name: "empty",
                    poses: &ECCV_POSES,
                    vehicles: 0,
                    pedestrians: 0,
                },
                TaskDef {
                    name: "normal",
                    poses: &ECCV_POSES,
                    vehicles: 20,
                    pedestrians: 50,
                },
            ],
        )
    }
}

const NOCRASH_POSES: [[u32; 2]; 4] = [[19, 66], [79, 14], [19, 57], [23, 1]];

struct NocrashSuite {
    new_weather: bool,
}

impl BenchmarkSuite for NocrashSuite {
    fn id(&self) -> SuiteId {
        if self.new_weather {
            SuiteId::NocrashNewWeather
        } else {
            SuiteId::NocrashTraining
        }
    }

    fn weathers(&self) -> Vec<WeatherId> {
        if self.new_weather {
            NEW_WEATHERS.to_vec()
        } else {
            TRAINING_WEATHERS.to_vec()
        }
    }

    fn build_experiments(&self) -> Vec<Experiment> {
        expand(
            &self.weathers(),
            &[
                TaskDef {
                    name: "empty",
                    poses: &NOCRASH_POSES,
                    vehicles: 0,
                    pedestrians: 0,
                },
                TaskDef {
                    name: "regular",
                    poses: &NOCRASH_POSES,
                    vehicles: 20,
                    pedestrians: 50,
                },
                TaskDef {
                    name: "dense",
                    poses: &NOCRASH_POSES,
                    vehicles: 100,
                    pedestrians: 250,
                },
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_round_trips_every_suite_name() {
        for id in SuiteId::ALL {
            let parsed = SuiteId::parse(id.name()).expect("known suite");
            assert_eq!(parsed, id);
            assert_eq!(parsed.build().id(), id);
        }
        let err = SuiteId::parse("Nonexistent").expect_err("unknown");
        assert!(err.to_string().contains("unknown_suite"), "{}", err);
    }

    #[test]
    fn task_list_is_unique_in_first_appearance_order() {
        let suite = SuiteId::NocrashTraining.build();
        let experiments = suite.build_experiments();
        assert_eq!(experiments.len(), 4 * 3);
        let tasks = suite.task_list();
        assert_eq!(tasks.names(), &["empty", "regular", "dense"]);
        assert_eq!(tasks.reference(), Some("empty"));
        assert_eq!(suite.episodes_per_condition(), 4);
    }

    #[test]
    fn every_cell_of_a_suite_has_the_same_episode_count() {
        for id in SuiteId::ALL {
            let suite = id.build();
            let expected = suite.episodes_per_condition();
            assert!(expected > 0, "{} has no poses", id);
            for exp in suite.build_experiments() {
                assert_eq!(exp.poses.len(), expected, "{} / {}", id, exp.task_name);
                assert!(suite.weathers().contains(&exp.weather));
            }
        }
    }

    #[test]
    fn task_list_new_drops_duplicates() {
        let tasks = TaskList::new(vec![
            "normal".to_string(),
            "empty".to_string(),
            "normal".to_string(),
        ]);
        assert_eq!(tasks.names(), &["normal", "empty"]);
        assert_eq!(tasks.iter().collect::<Vec<_>>(), vec![(0, "normal"), (1, "empty")]);
    }
}
