use crate::config::HarnessConfig;
use crate::context::ComputeContext;
use crate::error::HarnessError;
use crate::foreach::LaunchOptions;
use crate::script::{Kernel, Script, Value};
use crate::signal::{RS_MSG_TEST_FAILED, RS_MSG_TEST_PASSED};
use crate::unit_test::{check_message, UnitTest};
use anyhow::{Context, Result};

pub const DIM_X: u32 = 1024;
pub const DIM_Y: u32 = 768;

/// Value `entrypoint` leaves at linear index `i` of row `y`.
pub fn entrypoint_expected(i: i32, y: u32, dim_y: u32) -> i32 {
    let factor = if y < dim_y / 2 { 9 } else { 5 };
    i.wrapping_mul(factor).wrapping_add(1)
}

/// Value after `entrypoint`, `oldFoo` and `oldGoo`.
pub fn validate_expected(i: i32, y: u32, dim_y: u32) -> i32 {
    entrypoint_expected(i, y, dim_y).wrapping_mul(2).wrapping_add(1)
}

/// Script exercising nested launches, windowed launches, two-input kernels
/// and launches queued directly from the host.
pub fn single_source_script() -> Script<i32> {
    Script::builder("single_source_script")
        .kernel("foo", Kernel::map(|a: i32, _, _| a.wrapping_mul(2)))
        .kernel("goo", Kernel::zip(|a: i32, b: i32, _, _| a.wrapping_add(b)))
        .kernel("bar", Kernel::update(|a: i32, _, _| a.wrapping_add(1)))
        .kernel("oldFoo", Kernel::map(|a: i32, _, _| a.wrapping_mul(2)))
        .kernel("oldGoo", Kernel::map(|a: i32, _, _| a.wrapping_add(1)))
        .invokable("entrypoint", |env, args| {
            let input = args
                .first()
                .ok_or_else(|| HarnessError::InvalidArgument("entrypoint(in, out)".into()))?
                .as_allocation()?
                .clone();
            let output = args
                .get(1)
                .ok_or_else(|| HarnessError::InvalidArgument("entrypoint(in, out)".into()))?
                .as_allocation()?
                .clone();
            let dim_x = env.global_i32("dimX")?;
            let dim_y = env.global_i32("dimY")? as u32;

            let linear: Vec<i32> = (0..input.len() as i32).collect();
            if dim_x as u32 != input.dim_x() {
                return Err(HarnessError::InvalidArgument(format!(
                    "dimX is {dim_x} but the input is {} wide",
                    input.dim_x()
                )));
            }
            input.copy_from(&linear)?;

            env.for_each("foo", &[&input], &output, None)?;
            env.for_each("foo", &[&output], &output, None)?;
            // top half only; a one-row grid has no top half
            if dim_y / 2 > 0 {
                env.for_each("foo", &[&output], &output, Some(LaunchOptions::rows(0, dim_y / 2)))?;
            }
            env.for_each("goo", &[&input, &output], &output, None)?;
            env.for_each("bar", &[], &output, None)?;
            Ok(())
        })
        .invokable("validate", |env, args| {
            let output = args
                .first()
                .ok_or_else(|| HarnessError::InvalidArgument("validate(out)".into()))?
                .as_allocation()?;
            let dim_x = env.global_i32("dimX")?;
            let dim_y = env.global_i32("dimY")? as u32;
            if dim_x as u32 != output.dim_x() {
                return Err(HarnessError::InvalidArgument(format!(
                    "dimX is {dim_x} but the output is {} wide",
                    output.dim_x()
                )));
            }
            let dim_x = output.dim_x();

            let values = output.to_vec()?;
            let mismatch = values.iter().enumerate().find_map(|(i, &actual)| {
                let (x, y) = (i as u32 % dim_x, i as u32 / dim_x);
                let expected = validate_expected(i as i32, y, dim_y);
                (actual != expected).then_some((x, y, expected, actual))
            });

            match mismatch {
                None => env.send_to_client(RS_MSG_TEST_PASSED),
                Some((x, y, expected, actual)) => {
                    log::error!(
                        "{}: mismatch at ({x}, {y}): expected {expected}, got {actual}",
                        env.script_name()
                    );
                    env.send_to_client(RS_MSG_TEST_FAILED);
                }
            }
            Ok(())
        })
        .build()
}

pub struct SingleSourceScript {
    dim_x: u32,
    dim_y: u32,
}

impl Default for SingleSourceScript {
    fn default() -> Self {
        Self::new(DIM_X, DIM_Y)
    }
}

impl SingleSourceScript {
    pub fn new(dim_x: u32, dim_y: u32) -> Self {
        Self { dim_x, dim_y }
    }
}

impl UnitTest for SingleSourceScript {
    fn name(&self) -> &str {
        "SingleSourceScript"
    }

    fn run(&mut self, config: &HarnessConfig) -> Result<()> {
        let mut rs =
            ComputeContext::create(config.clone()).context("Failed to create compute context")?;
        let script = rs.load_script(single_source_script())?;

        let dim_x = i32::try_from(self.dim_x).context("dimX out of range")?;
        let dim_y = i32::try_from(self.dim_y).context("dimY out of range")?;
        rs.set_global(&script, "dimX", Value::Int(dim_x))?;
        rs.set_global(&script, "dimY", Value::Int(dim_y))?;

        let a = rs.create_buffer::<i32>(self.dim_x, self.dim_y)?;
        let b = rs.create_buffer::<i32>(self.dim_x, self.dim_y)?;

        rs.invoke(&script, "entrypoint", &[Value::from(&a), Value::from(&b)])?;
        rs.for_each(&script, "oldFoo", &b, &b)?;
        rs.for_each(&script, "oldGoo", &b, &b)?;
        rs.invoke(&script, "validate", &[Value::from(&b)])?;

        rs.finish().context("Kernels did not finish")?;
        let message = rs.wait_for_message().context("No validation message")?;
        rs.destroy()?;

        check_message(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_values_split_at_half_height() {
        // row 0 is in the top half, row 3 of 4 in the bottom half
        assert_eq!(entrypoint_expected(5, 0, 4), 46);
        assert_eq!(entrypoint_expected(13, 3, 4), 66);
        assert_eq!(validate_expected(5, 0, 4), 93);
    }

    #[test]
    fn small_grid_passes() {
        let mut test = SingleSourceScript::new(16, 12);
        test.run(&HarnessConfig::default()).unwrap();
    }

    #[test]
    fn validate_rejects_a_width_that_disagrees_with_the_buffer() {
        let rs = ComputeContext::create(HarnessConfig::default()).unwrap();
        let script = rs.load_script(single_source_script()).unwrap();
        rs.set_global(&script, "dimX", Value::Int(0)).unwrap();
        rs.set_global(&script, "dimY", Value::Int(4)).unwrap();
        let out = rs.create_buffer::<i32>(4, 4).unwrap();

        rs.invoke(&script, "validate", &[Value::from(&out)]).unwrap();
        assert!(matches!(
            rs.finish(),
            Err(HarnessError::InvalidArgument(_))
        ));
    }

    #[test]
    fn odd_height_passes() {
        let mut test = SingleSourceScript::new(7, 5);
        test.run(&HarnessConfig::default()).unwrap();
    }
}
