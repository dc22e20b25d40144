pub mod single_source_script;

use crate::unit_test::UnitTest;

pub use single_source_script::SingleSourceScript;

/// Every bundled unit test, in run order.
pub fn all_tests() -> Vec<Box<dyn UnitTest>> {
    vec![Box::new(SingleSourceScript::default())]
}
