//! 场景层：来访者画像模型与场景库

pub mod library;
pub mod model;

pub use library::{load_scenario_file, ScenarioLibrary};
pub use model::{Ambivalence, Scenario};
