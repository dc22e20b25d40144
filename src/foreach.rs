use crate::allocation::Allocation;
use crate::config::{GpuConfig, HarnessConfig};
use crate::element::Element;
use crate::error::{HarnessError, Result};
use crate::gpu::GpuDevice;
use crate::script::{Kernel, WgslKernel};
use ndarray::{s, Zip};
use std::time::Instant;

/// Restricts a launch to `[x_start, x_end) x [y_start, y_end)`.
/// An end of 0 means "up to the edge of the output".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaunchOptions {
    pub x_start: u32,
    pub x_end: u32,
    pub y_start: u32,
    pub y_end: u32,
}

impl LaunchOptions {
    pub fn rows(y_start: u32, y_end: u32) -> Self {
        Self {
            y_start,
            y_end,
            ..Self::default()
        }
    }

    pub fn columns(x_start: u32, x_end: u32) -> Self {
        Self {
            x_start,
            x_end,
            ..Self::default()
        }
    }
}

/// Resolved iteration window of a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Window {
    pub x0: u32,
    pub x1: u32,
    pub y0: u32,
    pub y1: u32,
}

impl Window {
    fn resolve(kernel: &str, options: LaunchOptions, shape: (u32, u32)) -> Result<Self> {
        let (dim_x, dim_y) = shape;
        let x1 = if options.x_end == 0 { dim_x } else { options.x_end };
        let y1 = if options.y_end == 0 { dim_y } else { options.y_end };
        if x1 > dim_x || y1 > dim_y {
            return Err(HarnessError::ShapeMismatch {
                kernel: kernel.to_string(),
                expected: shape,
                actual: (x1, y1),
            });
        }
        if options.x_start >= x1 || options.y_start >= y1 {
            return Err(HarnessError::InvalidArgument(format!(
                "empty launch window for `{kernel}`: x {}..{x1}, y {}..{y1}",
                options.x_start, options.y_start
            )));
        }
        Ok(Self {
            x0: options.x_start,
            x1,
            y0: options.y_start,
            y1,
        })
    }

    pub fn width(&self) -> u32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> u32 {
        self.y1 - self.y0
    }
}

/// Validates arity and shapes of a launch before anything runs.
pub(crate) fn check_launch<T: Element>(
    name: &str,
    kernel: &Kernel<T>,
    inputs: &[&Allocation<T>],
    output: &Allocation<T>,
    options: Option<LaunchOptions>,
) -> Result<Window> {
    if inputs.len() != kernel.arity() {
        return Err(HarnessError::InvalidArgument(format!(
            "kernel `{name}` takes {} input(s), {} given",
            kernel.arity(),
            inputs.len()
        )));
    }
    for input in inputs {
        if input.shape() != output.shape() {
            return Err(HarnessError::ShapeMismatch {
                kernel: name.to_string(),
                expected: output.shape(),
                actual: input.shape(),
            });
        }
    }
    Window::resolve(name, options.unwrap_or_default(), output.shape())
}

/// Runs kernels for one context. Lives on the context worker thread.
pub struct Executor {
    pool: rayon::ThreadPool,
    gpu: Option<GpuDevice>,
    gpu_config: GpuConfig,
}

impl Executor {
    pub(crate) fn new(config: &HarnessConfig) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads)
            .thread_name(|i| format!("rs-kernel-{i}"))
            .build()
            .map_err(|e| HarnessError::Lifecycle(format!("failed to start kernel pool: {e}")))?;
        log::debug!("kernel pool started with {} threads", pool.current_num_threads());
        Ok(Self {
            pool,
            gpu: None,
            gpu_config: config.gpu.clone(),
        })
    }

    pub(crate) fn launch<T: Element>(
        &mut self,
        name: &str,
        kernel: &Kernel<T>,
        inputs: &[&Allocation<T>],
        output: &Allocation<T>,
        window: Window,
    ) -> Result<()> {
        let started = Instant::now();
        let result = match kernel {
            Kernel::Wgsl(wgsl) => self.launch_gpu(name, wgsl, inputs[0], output, window),
            _ => self
                .pool
                .install(|| run_cpu(name, kernel, inputs, output, window)),
        };
        log::debug!(
            "kernel `{name}` over {}x{} finished in {:?}",
            window.width(),
            window.height(),
            started.elapsed()
        );
        result
    }

    fn launch_gpu<T: Element>(
        &mut self,
        name: &str,
        kernel: &WgslKernel,
        input: &Allocation<T>,
        output: &Allocation<T>,
        window: Window,
    ) -> Result<()> {
        let element = T::KIND.wgsl_type().ok_or_else(|| {
            HarnessError::kernel_failed(name, format!("{} buffers cannot run on the GPU", T::KIND))
        })?;
        let gpu = self.gpu()?;

        // Snapshot first so an in-place launch does not hold two locks.
        let source: Vec<T> = input.read().iter().copied().collect();
        let mut out = output.write();
        let target = out
            .as_slice_mut()
            .ok_or_else(|| HarnessError::kernel_failed(name, "output is not contiguous"))?;
        gpu.run_elementwise(name, kernel, element, &source, target, output.shape(), window)
    }

    fn gpu(&mut self) -> Result<&mut GpuDevice> {
        if self.gpu.is_none() {
            if !self.gpu_config.enabled {
                return Err(HarnessError::Gpu("GPU kernels are disabled".to_string()));
            }
            self.gpu = Some(GpuDevice::new(&self.gpu_config)?);
        }
        self.gpu
            .as_mut()
            .ok_or_else(|| HarnessError::Gpu("no device".to_string()))
    }
}

fn run_cpu<T: Element>(
    name: &str,
    kernel: &Kernel<T>,
    inputs: &[&Allocation<T>],
    output: &Allocation<T>,
    w: Window,
) -> Result<()> {
    let (x0, x1, y0, y1) = (w.x0 as usize, w.x1 as usize, w.y0 as usize, w.y1 as usize);
    let at = |i: usize, j: usize| (w.x0 + i as u32, w.y0 + j as u32);

    let mut out_guard = output.write();
    let mut out = out_guard.slice_mut(s![y0..y1, x0..x1]);

    match kernel {
        Kernel::Update(f) => {
            Zip::indexed(&mut out).par_for_each(|(j, i), o| {
                let (x, y) = at(i, j);
                *o = f(*o, x, y);
            });
        }
        Kernel::Map(f) => {
            let a = inputs[0];
            if a.same_as(output) {
                Zip::indexed(&mut out).par_for_each(|(j, i), o| {
                    let (x, y) = at(i, j);
                    *o = f(*o, x, y);
                });
            } else {
                let a_guard = a.read();
                let a_view = a_guard.slice(s![y0..y1, x0..x1]);
                Zip::indexed(&mut out)
                    .and(&a_view)
                    .par_for_each(|(j, i), o, &a| {
                        let (x, y) = at(i, j);
                        *o = f(a, x, y);
                    });
            }
        }
        Kernel::Zip(f) => {
            let (a, b) = (inputs[0], inputs[1]);
            match (a.same_as(output), b.same_as(output)) {
                (true, true) => {
                    Zip::indexed(&mut out).par_for_each(|(j, i), o| {
                        let (x, y) = at(i, j);
                        *o = f(*o, *o, x, y);
                    });
                }
                (true, false) => {
                    let b_guard = b.read();
                    let b_view = b_guard.slice(s![y0..y1, x0..x1]);
                    Zip::indexed(&mut out)
                        .and(&b_view)
                        .par_for_each(|(j, i), o, &b| {
                            let (x, y) = at(i, j);
                            *o = f(*o, b, x, y);
                        });
                }
                (false, true) => {
                    let a_guard = a.read();
                    let a_view = a_guard.slice(s![y0..y1, x0..x1]);
                    Zip::indexed(&mut out)
                        .and(&a_view)
                        .par_for_each(|(j, i), o, &a| {
                            let (x, y) = at(i, j);
                            *o = f(a, *o, x, y);
                        });
                }
                (false, false) => {
                    let a_guard = a.read();
                    let a_view = a_guard.slice(s![y0..y1, x0..x1]);
                    // One read guard per distinct allocation.
                    let b_guard = if b.same_as(a) { None } else { Some(b.read()) };
                    let b_view = match &b_guard {
                        Some(guard) => guard.slice(s![y0..y1, x0..x1]),
                        None => a_guard.slice(s![y0..y1, x0..x1]),
                    };
                    Zip::indexed(&mut out)
                        .and(&a_view)
                        .and(&b_view)
                        .par_for_each(|(j, i), o, &a, &b| {
                            let (x, y) = at(i, j);
                            *o = f(a, b, x, y);
                        });
                }
            }
        }
        Kernel::Wgsl(_) => {
            return Err(HarnessError::kernel_failed(name, "WGSL kernels run on the GPU"));
        }
    }
    Ok(())
}
