//! Histogram construction on a wgpu adapter.
//!
//! Platforms are the wgpu backends present on the machine, in the order the
//! adapters are enumerated, and devices are the adapters of each backend. The
//! kernel accumulates in single precision, there is no portable f64 support
//! in WGSL.

use super::{
    workgroups_for, ComputeDevice, DeviceConfig, MemoryBudget, PendingHistograms, PendingState,
};
use crate::binning::BinnedDataset;
use crate::data::JaggedMatrix;
use crate::errors::DeviceError;
use crate::histogram::{Bin, HistogramMatrix};
use crate::objective::GradientBuffer;
use bytemuck::{Pod, Zeroable};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::mpsc;
use wgpu::util::DeviceExt;

/// Must match `@workgroup_size` in the shader.
const WORKGROUP_SIZE: usize = 64;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Params {
    n_rows: u32,
    n_features: u32,
    n_blocks: u32,
    block_size: u32,
    total_bins: u32,
    data_rows: u32,
    pad0: u32,
    pad1: u32,
}

struct FeatureBuffers {
    bins: wgpu::Buffer,
    offsets: wgpu::Buffer,
    rows: usize,
    n_bins: Vec<usize>,
    total_bins: usize,
    bytes: usize,
}

struct GradientBuffers {
    grad: wgpu::Buffer,
    hess: wgpu::Buffer,
    bytes: usize,
}

/// Host readable copies of the reduced histogram of one node.
struct Readback {
    sums: wgpu::Buffer,
    counts: wgpu::Buffer,
}

/// A compute device backed by a wgpu adapter.
pub struct WgpuDevice {
    config: DeviceConfig,
    name: String,
    device: wgpu::Device,
    queue: wgpu::Queue,
    limits: wgpu::Limits,
    accumulate: wgpu::ComputePipeline,
    reduce: wgpu::ComputePipeline,
    memory: MemoryBudget,
    features: Option<FeatureBuffers>,
    gradients: Option<GradientBuffers>,
    next_launch: u64,
    in_flight: HashMap<u64, Vec<Readback>>,
}

fn select_adapter(
    instance: &wgpu::Instance,
    platform_id: usize,
    device_id: usize,
) -> Result<wgpu::Adapter, DeviceError> {
    let mut platforms: Vec<(wgpu::Backend, Vec<wgpu::Adapter>)> = Vec::new();
    for adapter in instance.enumerate_adapters(wgpu::Backends::all()) {
        let backend = adapter.get_info().backend;
        match platforms.iter_mut().find(|(b, _)| *b == backend) {
            Some((_, adapters)) => adapters.push(adapter),
            None => platforms.push((backend, vec![adapter])),
        }
    }
    platforms
        .into_iter()
        .nth(platform_id)
        .and_then(|(_, adapters)| adapters.into_iter().nth(device_id))
        .ok_or(DeviceError::NotFound(platform_id, device_id))
}

fn entry(binding: u32, buffer: &wgpu::Buffer) -> wgpu::BindGroupEntry<'_> {
    wgpu::BindGroupEntry {
        binding,
        resource: buffer.as_entire_binding(),
    }
}

fn read_words(buffer: &wgpu::Buffer, n: usize) -> Vec<[u8; 4]> {
    let view = buffer.slice(..).get_mapped_range();
    let words = view
        .chunks_exact(4)
        .take(n)
        .map(|b| [b[0], b[1], b[2], b[3]])
        .collect();
    drop(view);
    buffer.unmap();
    words
}

fn to_histograms(n_bins: &[usize], sums: &[f32], counts: &[u32]) -> HistogramMatrix {
    let mut start = 0;
    let columns: Vec<Vec<Bin>> = n_bins
        .iter()
        .map(|n| {
            let column = (start..(start + n))
                .map(|b| Bin {
                    gradient_sum: f64::from(sums[2 * b]),
                    hessian_sum: f64::from(sums[2 * b + 1]),
                    count: counts[b],
                })
                .collect();
            start += n;
            column
        })
        .collect();
    HistogramMatrix(JaggedMatrix::from_vecs(columns))
}

impl WgpuDevice {
    /// Open the adapter identified by the platform and device id.
    pub fn open(config: DeviceConfig) -> Result<Self, DeviceError> {
        if config.use_dp {
            return Err(DeviceError::Unsupported(
                "double precision accumulation".to_string(),
            ));
        }
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter = select_adapter(&instance, config.platform_id, config.device_id)?;
        let info = adapter.get_info();
        let limits = adapter.limits();
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("histboost"),
                required_features: wgpu::Features::empty(),
                required_limits: limits.clone(),
            },
            None,
        ))
        .map_err(|e| DeviceError::LaunchFailed(e.to_string()))?;

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("histogram"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(include_str!("histogram.wgsl"))),
        });
        let pipeline = |entry_point: &str| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry_point),
                layout: None,
                module: &shader,
                entry_point,
            })
        };
        let accumulate = pipeline("accumulate");
        let reduce = pipeline("reduce");
        if let Some(e) = pollster::block_on(device.pop_error_scope()) {
            return Err(DeviceError::LaunchFailed(e.to_string()));
        }

        Ok(WgpuDevice {
            name: format!("{} ({:?})", info.name, info.backend),
            memory: MemoryBudget::new(config.memory_bytes),
            config,
            device,
            queue,
            limits,
            accumulate,
            reduce,
            features: None,
            gradients: None,
            next_launch: 0,
            in_flight: HashMap::new(),
        })
    }

    fn max_binding(&self) -> usize {
        u64::from(self.limits.max_storage_buffer_binding_size).min(self.limits.max_buffer_size)
            as usize
    }

    fn storage_buffer<T: Pod>(
        &self,
        label: &str,
        contents: &[T],
    ) -> Result<wgpu::Buffer, DeviceError> {
        let bytes: &[u8] = bytemuck::cast_slice(contents);
        if bytes.len() > self.max_binding() {
            return Err(DeviceError::OutOfMemory(bytes.len(), self.max_binding()));
        }
        // Zero sized bindings are not allowed.
        let padding = [0u8; 8];
        Ok(self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: if bytes.is_empty() { &padding[..] } else { bytes },
                usage: wgpu::BufferUsages::STORAGE,
            }))
    }

    fn empty_buffer(&self, label: &str, bytes: usize, usage: wgpu::BufferUsages) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: bytes.max(8) as u64,
            usage,
            mapped_at_creation: false,
        })
    }

    fn dispatch_size(&self, invocations: usize) -> Result<u32, DeviceError> {
        let groups = (invocations + WORKGROUP_SIZE - 1) / WORKGROUP_SIZE;
        if groups > self.limits.max_compute_workgroups_per_dimension as usize {
            return Err(DeviceError::LaunchFailed(format!(
                "{} workgroups exceed the dispatch limit of {}",
                groups, self.limits.max_compute_workgroups_per_dimension
            )));
        }
        Ok(groups as u32)
    }
}

impl ComputeDevice for WgpuDevice {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn upload_features(&mut self, data: &BinnedDataset) -> Result<(), DeviceError> {
        if let Some(old) = self.features.take() {
            self.memory.release(old.bytes);
        }
        let packed: Vec<u32> = data
            .binned_data
            .chunks(2)
            .map(|p| u32::from(p[0]) | (u32::from(p.get(1).copied().unwrap_or(0)) << 16))
            .collect();
        let n_bins = data.n_bins();
        let mut offsets: Vec<u32> = Vec::with_capacity(n_bins.len());
        let mut total_bins = 0;
        for n in n_bins.iter() {
            offsets.push(total_bins as u32);
            total_bins += n;
        }
        let bytes = (packed.len() + offsets.len()) * std::mem::size_of::<u32>();
        self.memory.allocate(bytes)?;
        let buffers = self
            .storage_buffer("bins", &packed)
            .and_then(|bins| Ok((bins, self.storage_buffer("offsets", &offsets)?)));
        let (bins, offsets) = match buffers {
            Ok(b) => b,
            Err(e) => {
                self.memory.release(bytes);
                return Err(e);
            }
        };
        self.features = Some(FeatureBuffers {
            bins,
            offsets,
            rows: data.rows,
            n_bins,
            total_bins,
            bytes,
        });
        Ok(())
    }

    fn upload_gradients(&mut self, gradients: &GradientBuffer) -> Result<(), DeviceError> {
        if let Some(old) = self.gradients.take() {
            self.memory.release(old.bytes);
        }
        let bytes = gradients.len() * 2 * std::mem::size_of::<f32>();
        self.memory.allocate(bytes)?;
        let buffers = self
            .storage_buffer("grad", &gradients.grad)
            .and_then(|grad| Ok((grad, self.storage_buffer("hess", &gradients.hess)?)));
        let (grad, hess) = match buffers {
            Ok(b) => b,
            Err(e) => {
                self.memory.release(bytes);
                return Err(e);
            }
        };
        self.gradients = Some(GradientBuffers { grad, hess, bytes });
        Ok(())
    }

    fn launch_histograms(&mut self, nodes: &[&[usize]]) -> Result<PendingHistograms, DeviceError> {
        let features = self
            .features
            .as_ref()
            .ok_or(DeviceError::FeaturesNotUploaded)?;
        let gradients = self
            .gradients
            .as_ref()
            .ok_or(DeviceError::GradientsNotUploaded)?;
        let n_features = features.n_bins.len();
        let total_bins = features.total_bins;

        // Size every launch up front, so nothing is encoded if one cannot run.
        let mut shapes = Vec::with_capacity(nodes.len());
        let mut transient = 0;
        for index in nodes {
            let n_blocks = workgroups_for(
                index.len(),
                self.config.workgroup_size,
                self.config.max_workgroups,
            );
            let block_size = (index.len() + n_blocks - 1) / n_blocks;
            let partial_bytes = n_blocks * total_bins * 3 * std::mem::size_of::<u32>();
            if partial_bytes > self.max_binding() {
                return Err(DeviceError::OutOfMemory(partial_bytes, self.max_binding()));
            }
            transient += index.len() * std::mem::size_of::<u32>() + partial_bytes;
            let accumulate_groups = self.dispatch_size(n_features * n_blocks)?;
            shapes.push((n_blocks, block_size, accumulate_groups));
        }
        self.memory.check(transient)?;
        let reduce_groups = self.dispatch_size(total_bins)?;

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("histograms"),
            });
        let mut readbacks = Vec::with_capacity(nodes.len());
        for (index, (n_blocks, block_size, accumulate_groups)) in nodes.iter().zip(shapes) {
            let rows: Vec<u32> = index.iter().map(|i| *i as u32).collect();
            let params = Params {
                n_rows: rows.len() as u32,
                n_features: n_features as u32,
                n_blocks: n_blocks as u32,
                block_size: block_size as u32,
                total_bins: total_bins as u32,
                data_rows: features.rows as u32,
                pad0: 0,
                pad1: 0,
            };
            let params = self
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("params"),
                    contents: bytemuck::bytes_of(&params),
                    usage: wgpu::BufferUsages::UNIFORM,
                });
            let padding = [0u32; 2];
            let rows = if rows.is_empty() { &padding[..] } else { &rows[..] };
            let rows = self
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("rows"),
                    contents: bytemuck::cast_slice(rows),
                    usage: wgpu::BufferUsages::STORAGE,
                });
            // New buffers are zero initialized.
            let partial_usage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC;
            let sums = self.empty_buffer("sums", n_blocks * total_bins * 8, partial_usage);
            let counts = self.empty_buffer("counts", n_blocks * total_bins * 4, partial_usage);
            let read_usage = wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST;
            let readback = Readback {
                sums: self.empty_buffer("sums readback", total_bins * 8, read_usage),
                counts: self.empty_buffer("counts readback", total_bins * 4, read_usage),
            };

            let accumulate_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("accumulate"),
                layout: &self.accumulate.get_bind_group_layout(0),
                entries: &[
                    entry(0, &params),
                    entry(1, &features.bins),
                    entry(2, &features.offsets),
                    entry(3, &gradients.grad),
                    entry(4, &gradients.hess),
                    entry(5, &rows),
                    entry(6, &sums),
                    entry(7, &counts),
                ],
            });
            let reduce_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("reduce"),
                layout: &self.reduce.get_bind_group_layout(0),
                entries: &[entry(0, &params), entry(6, &sums), entry(7, &counts)],
            });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("accumulate"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&self.accumulate);
                pass.set_bind_group(0, &accumulate_group, &[]);
                pass.dispatch_workgroups(accumulate_groups, 1, 1);
            }
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("reduce"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&self.reduce);
                pass.set_bind_group(0, &reduce_group, &[]);
                pass.dispatch_workgroups(reduce_groups, 1, 1);
            }
            // The first block holds the reduced histogram.
            encoder.copy_buffer_to_buffer(&sums, 0, &readback.sums, 0, (total_bins * 8) as u64);
            encoder.copy_buffer_to_buffer(&counts, 0, &readback.counts, 0, (total_bins * 4) as u64);
            readbacks.push(readback);
        }
        self.queue.submit(Some(encoder.finish()));
        let validation = pollster::block_on(self.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());
        if let Some(e) = validation.or(out_of_memory) {
            return Err(DeviceError::LaunchFailed(e.to_string()));
        }

        let id = self.next_launch;
        self.next_launch += 1;
        self.in_flight.insert(id, readbacks);
        Ok(PendingHistograms {
            state: PendingState::Submitted(id),
        })
    }

    fn synchronize(
        &mut self,
        pending: PendingHistograms,
    ) -> Result<Vec<HistogramMatrix>, DeviceError> {
        let id = match pending.state {
            PendingState::Submitted(id) => id,
            PendingState::Channel(_) => {
                return Err(DeviceError::LaunchFailed(
                    "launch belongs to another device".to_string(),
                ))
            }
        };
        let readbacks = self
            .in_flight
            .remove(&id)
            .ok_or_else(|| DeviceError::LaunchFailed(format!("unknown launch {}", id)))?;
        let n_bins = self
            .features
            .as_ref()
            .map(|f| f.n_bins.clone())
            .ok_or(DeviceError::FeaturesNotUploaded)?;
        let total_bins: usize = n_bins.iter().sum();

        let (sender, receiver) = mpsc::channel();
        for readback in readbacks.iter() {
            for buffer in [&readback.sums, &readback.counts] {
                let sender = sender.clone();
                buffer.slice(..).map_async(wgpu::MapMode::Read, move |result| {
                    let _ = sender.send(result);
                });
            }
        }
        drop(sender);
        let _ = self.device.poll(wgpu::Maintain::Wait);
        let mapped: Vec<Result<(), wgpu::BufferAsyncError>> = receiver.try_iter().collect();
        if mapped.len() != readbacks.len() * 2 {
            return Err(DeviceError::LaunchFailed(
                "histogram readback did not complete".to_string(),
            ));
        }
        for result in mapped {
            result.map_err(|e| DeviceError::LaunchFailed(e.to_string()))?;
        }

        Ok(readbacks
            .iter()
            .map(|r| {
                let sums: Vec<f32> = read_words(&r.sums, 2 * total_bins)
                    .into_iter()
                    .map(f32::from_le_bytes)
                    .collect();
                let counts: Vec<u32> = read_words(&r.counts, total_bins)
                    .into_iter()
                    .map(u32::from_le_bytes)
                    .collect();
                to_histograms(&n_bins, &sums, &counts)
            })
            .collect())
    }
}
