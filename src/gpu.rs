use crate::config::GpuConfig;
use crate::error::{HarnessError, Result};
use crate::foreach::Window;
use crate::script::WgslKernel;
use crate::shaders::{elementwise_shader, WORKGROUP_EDGE, WRAPPER_ENTRY_POINT};
use bytemuck::{Pod, Zeroable};
use std::collections::HashMap;
use wgpu::util::DeviceExt;

// Struct for passing the launch window to the wrapper shader
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct LaunchGrid {
    pub dim_x: u32,
    pub dim_y: u32,
    pub x_start: u32,
    pub y_start: u32,
    pub x_end: u32,
    pub y_end: u32,
    pub _padding: [u32; 2], // For 16-byte alignment
}

struct CompiledKernel {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
}

/// wgpu device used for `Kernel::Wgsl` launches.
pub struct GpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_name: String,
    // keyed by the generated shader source
    pipelines: HashMap<String, CompiledKernel>,
}

impl GpuDevice {
    pub fn new(config: &GpuConfig) -> Result<Self> {
        pollster::block_on(Self::request(config))
    }

    async fn request(config: &GpuConfig) -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::VULKAN | wgpu::Backends::METAL | wgpu::Backends::DX12,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: config.power_preference.into(),
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| HarnessError::Gpu("Failed to find suitable adapter".to_string()))?;

        let adapter_info = adapter.get_info();
        log::info!("Using GPU: {} ({:?})", adapter_info.name, adapter_info.backend);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("rs_harness device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                },
                None,
            )
            .await
            .map_err(|e| HarnessError::Gpu(e.to_string()))?;

        Ok(Self {
            device,
            queue,
            adapter_name: adapter_info.name,
            pipelines: HashMap::new(),
        })
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    pub fn create_buffer_with_data<T: Pod>(
        &self,
        label: &str,
        data: &[T],
        usage: wgpu::BufferUsages,
    ) -> wgpu::Buffer {
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::cast_slice(data),
                usage,
            })
    }

    pub fn create_empty_buffer(&self, size: u64, usage: wgpu::BufferUsages) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size,
            usage,
            mapped_at_creation: false,
        })
    }

    /// Copies `buffer` back to the host into `target`.
    pub async fn read_buffer<T: Pod>(&self, buffer: &wgpu::Buffer, target: &mut [T]) -> Result<()> {
        let size = std::mem::size_of_val(target) as u64;
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let staging_buffer = self.create_empty_buffer(
            size,
            wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        );

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging_buffer, 0, size);
        self.queue.submit(Some(encoder.finish()));
        if let Some(err) = self.device.pop_error_scope().await {
            return Err(HarnessError::Gpu(format!("readback of {size} bytes failed: {err}")));
        }

        let buffer_slice = staging_buffer.slice(..);
        let (sender, receiver) = tokio::sync::oneshot::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            sender.send(result).ok();
        });

        self.device.poll(wgpu::Maintain::Wait);
        receiver
            .await
            .map_err(|_| HarnessError::Gpu("buffer map callback dropped".to_string()))?
            .map_err(|e| HarnessError::Gpu(e.to_string()))?;

        {
            let data = buffer_slice.get_mapped_range();
            target.copy_from_slice(bytemuck::cast_slice(&data));
        }
        staging_buffer.unmap();
        Ok(())
    }

    fn compile(&mut self, name: &str, source: String) -> Result<&CompiledKernel> {
        if !self.pipelines.contains_key(&source) {
            self.device.push_error_scope(wgpu::ErrorFilter::Validation);

            let shader = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(name),
                source: wgpu::ShaderSource::Wgsl(source.as_str().into()),
            });

            let storage = |binding, read_only| wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            };
            let bind_group_layout =
                self.device
                    .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                        label: None,
                        entries: &[
                            wgpu::BindGroupLayoutEntry {
                                binding: 0,
                                visibility: wgpu::ShaderStages::COMPUTE,
                                ty: wgpu::BindingType::Buffer {
                                    ty: wgpu::BufferBindingType::Uniform,
                                    has_dynamic_offset: false,
                                    min_binding_size: None,
                                },
                                count: None,
                            }, // LaunchGrid
                            storage(1, true),  // input
                            storage(2, false), // output
                        ],
                    });

            let pipeline_layout =
                self.device
                    .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                        label: None,
                        bind_group_layouts: &[&bind_group_layout],
                        push_constant_ranges: &[],
                    });

            let pipeline =
                self.device
                    .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                        label: Some(name),
                        layout: Some(&pipeline_layout),
                        module: &shader,
                        entry_point: WRAPPER_ENTRY_POINT,
                    });

            if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
                return Err(HarnessError::kernel_failed(name, err));
            }
            log::debug!("compiled WGSL kernel `{name}`");
            self.pipelines.insert(
                source.clone(),
                CompiledKernel {
                    pipeline,
                    bind_group_layout,
                },
            );
        }
        self.pipelines
            .get(&source)
            .ok_or_else(|| HarnessError::Gpu(format!("pipeline for `{name}` missing")))
    }

    /// Runs `kernel` over `window`. `output` carries the current contents of
    /// the destination so elements outside the window survive the round trip.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn run_elementwise<T: Pod>(
        &mut self,
        name: &str,
        kernel: &WgslKernel,
        element: &str,
        input: &[T],
        output: &mut [T],
        shape: (u32, u32),
        window: Window,
    ) -> Result<()> {
        let groups_x = window.width().div_ceil(WORKGROUP_EDGE);
        let groups_y = window.height().div_ceil(WORKGROUP_EDGE);
        let max_groups = self.device.limits().max_compute_workgroups_per_dimension;
        if groups_x > max_groups || groups_y > max_groups {
            return Err(HarnessError::kernel_failed(
                name,
                format!("{groups_x}x{groups_y} workgroups exceed the device limit of {max_groups}"),
            ));
        }

        let source = elementwise_shader(element, &kernel.source, &kernel.entry);
        self.compile(name, source.clone())?;
        let compiled = self
            .pipelines
            .get(&source)
            .ok_or_else(|| HarnessError::Gpu(format!("pipeline for `{name}` missing")))?;

        let grid = LaunchGrid {
            dim_x: shape.0,
            dim_y: shape.1,
            x_start: window.x0,
            y_start: window.y0,
            x_end: window.x1,
            y_end: window.y1,
            _padding: [0; 2],
        };

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let grid_buffer = self.create_buffer_with_data(
            "launch grid",
            &[grid],
            wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        );
        let input_buffer =
            self.create_buffer_with_data("kernel input", input, wgpu::BufferUsages::STORAGE);
        let output_buffer = self.create_buffer_with_data(
            "kernel output",
            output,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        );

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(name),
            layout: &compiled.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: grid_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: input_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: output_buffer.as_entire_binding(),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        {
            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(name),
                timestamp_writes: None,
            });
            compute_pass.set_pipeline(&compiled.pipeline);
            compute_pass.set_bind_group(0, &bind_group, &[]);
            compute_pass.dispatch_workgroups(groups_x, groups_y, 1);
        }
        self.queue.submit(Some(encoder.finish()));

        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(HarnessError::kernel_failed(name, err));
        }

        pollster::block_on(self.read_buffer(&output_buffer, output))
    }
}
