//! Device accelerated histogram construction.
//!
//! A [`ComputeDevice`] owns device resident copies of the binned features and
//! the gradients of the current iteration. Histogram kernels are launched
//! asynchronously, one launch building every feature histogram of a batch of
//! nodes, and the host only blocks in [`ComputeDevice::synchronize`], when the
//! split finder needs the result.
//!
//! Two devices are provided. With the `gpu` feature, [`WgpuDevice`] runs the
//! histogram kernel as a compute shader on any adapter wgpu can find.
//! [`SimulatedDevice`] runs the same kernel on the host, and is used when the
//! feature is disabled or no adapter is available.
//!
//! [`HybridHistogramBuilder`] routes small nodes to the CPU, where launch and
//! transfer overhead would dominate, and larger nodes to the device. The first
//! device failure downgrades the builder to the CPU for the rest of the run.

use crate::binning::BinnedDataset;
use crate::data::JaggedMatrix;
use crate::errors::DeviceError;
use crate::histogram::{Bin, CpuHistogramBuilder, HistogramBuilder, HistogramMatrix};
use crate::objective::GradientBuffer;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

#[cfg(feature = "gpu")]
mod wgpu_device;
#[cfg(feature = "gpu")]
pub use wgpu_device::WgpuDevice;

/// Where histograms should be built.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Cpu,
    Gpu,
}

/// Device selection and kernel configuration.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct DeviceConfig {
    pub platform_id: usize,
    pub device_id: usize,
    /// Accumulate in double precision on the device.
    pub use_dp: bool,
    /// Number of bytes of device memory available.
    pub memory_bytes: usize,
    /// Records handled by each work item of a workgroup.
    pub workgroup_size: usize,
    /// Upper bound on the number of workgroups per feature.
    pub max_workgroups: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            platform_id: 0,
            device_id: 0,
            use_dp: false,
            memory_bytes: 4 << 30,
            workgroup_size: 256,
            max_workgroups: 64,
        }
    }
}

/// A histogram launch that has been queued on the device, but whose
/// results have not yet been copied back to the host.
pub struct PendingHistograms {
    state: PendingState,
}

enum PendingState {
    /// The results will be sent by a device thread.
    Channel(Receiver<Result<Vec<HistogramMatrix>, DeviceError>>),
    /// The results stay on the device, under this launch id, until synchronized.
    #[cfg(feature = "gpu")]
    Submitted(u64),
}

impl PendingHistograms {
    fn from_channel(receiver: Receiver<Result<Vec<HistogramMatrix>, DeviceError>>) -> Self {
        PendingHistograms {
            state: PendingState::Channel(receiver),
        }
    }

    fn receive(self) -> Result<Vec<HistogramMatrix>, DeviceError> {
        match self.state {
            PendingState::Channel(receiver) => receiver
                .recv()
                .map_err(|e| DeviceError::LaunchFailed(e.to_string()))?,
            #[cfg(feature = "gpu")]
            PendingState::Submitted(id) => Err(DeviceError::LaunchFailed(format!(
                "launch {} belongs to another device",
                id
            ))),
        }
    }
}

/// A device capable of building gradient histograms.
pub trait ComputeDevice: Send {
    fn name(&self) -> String;

    /// Copy the binned feature matrix to device memory.
    fn upload_features(&mut self, data: &BinnedDataset) -> Result<(), DeviceError>;

    /// Copy the gradients of the current iteration to device memory.
    fn upload_gradients(&mut self, gradients: &GradientBuffer) -> Result<(), DeviceError>;

    /// Queue the histogram builds of a batch of nodes, this does not block.
    fn launch_histograms(&mut self, nodes: &[&[usize]]) -> Result<PendingHistograms, DeviceError>;

    /// Wait for a launch to finish, and copy the results to the host.
    fn synchronize(
        &mut self,
        pending: PendingHistograms,
    ) -> Result<Vec<HistogramMatrix>, DeviceError>;
}

/// Open the configured device. With the `gpu` feature an adapter is
/// looked up first, the simulated device is used if there is none.
pub fn open_device(config: &DeviceConfig) -> Result<Box<dyn ComputeDevice>, DeviceError> {
    #[cfg(feature = "gpu")]
    {
        match WgpuDevice::open(config.clone()) {
            Ok(device) => return Ok(Box::new(device)),
            Err(e) => log::info!("{}, using the simulated device.", e),
        }
    }
    Ok(Box::new(SimulatedDevice::open(config.clone())?))
}

/// Accounts the bytes allocated on a device, against its capacity.
#[derive(Debug, Clone, Copy)]
struct MemoryBudget {
    capacity: usize,
    allocated: usize,
}

impl MemoryBudget {
    fn new(capacity: usize) -> Self {
        MemoryBudget {
            capacity,
            allocated: 0,
        }
    }

    fn available(&self) -> usize {
        self.capacity.saturating_sub(self.allocated)
    }

    /// Fail if a transient allocation of this size would not fit.
    fn check(&self, bytes: usize) -> Result<(), DeviceError> {
        if bytes > self.available() {
            return Err(DeviceError::OutOfMemory(bytes, self.available()));
        }
        Ok(())
    }

    fn allocate(&mut self, bytes: usize) -> Result<(), DeviceError> {
        self.check(bytes)?;
        self.allocated += bytes;
        Ok(())
    }

    fn release(&mut self, bytes: usize) {
        self.allocated = self.allocated.saturating_sub(bytes);
    }
}

struct DeviceFeatures {
    bins: Vec<u16>,
    rows: usize,
    n_bins: Vec<usize>,
}

struct DeviceGradients {
    grad: Vec<f32>,
    hess: Vec<f32>,
}

struct KernelLaunch {
    features: Arc<DeviceFeatures>,
    gradients: Arc<DeviceGradients>,
    nodes: Vec<Vec<usize>>,
    use_dp: bool,
    workgroup_size: usize,
    max_workgroups: usize,
    result: Sender<Result<Vec<HistogramMatrix>, DeviceError>>,
}

/// Accumulator precision used by a kernel.
trait DeviceFloat: Copy + Default + Send + std::ops::AddAssign {
    fn from_f32(v: f32) -> Self;
    fn into_f64(self) -> f64;
}

impl DeviceFloat for f32 {
    fn from_f32(v: f32) -> Self {
        v
    }
    fn into_f64(self) -> f64 {
        f64::from(self)
    }
}

impl DeviceFloat for f64 {
    fn from_f32(v: f32) -> Self {
        f64::from(v)
    }
    fn into_f64(self) -> f64 {
        self
    }
}

#[derive(Clone, Copy, Default)]
struct DeviceBin<F> {
    grad: F,
    hess: F,
    count: u32,
}

/// The number of workgroups a feature histogram is split across.
/// Always a power of two, so the reduction tree is balanced.
fn workgroups_for(n_records: usize, workgroup_size: usize, max_workgroups: usize) -> usize {
    let wanted = (n_records / workgroup_size.max(1)).max(1);
    wanted.next_power_of_two().min(max_workgroups.max(1).next_power_of_two())
}

/// Build a single feature histogram the way a device kernel does, every workgroup
/// accumulates a contiguous block of the node into its own local histogram, then
/// the local histograms are combined with a pairwise reduction tree.
fn feature_kernel<F: DeviceFloat>(
    feature: &[u16],
    n_bins: usize,
    gradients: &DeviceGradients,
    index: &[usize],
    n_workgroups: usize,
) -> Vec<Bin> {
    let block = (index.len() + n_workgroups - 1) / n_workgroups.max(1);
    let mut locals: Vec<Vec<DeviceBin<F>>> = (0..n_workgroups)
        .into_par_iter()
        .map(|wg| {
            let mut local = vec![DeviceBin::<F>::default(); n_bins];
            let start = (wg * block).min(index.len());
            let stop = ((wg + 1) * block).min(index.len());
            for i in &index[start..stop] {
                let b = &mut local[feature[*i] as usize];
                b.grad += F::from_f32(gradients.grad[*i]);
                b.hess += F::from_f32(gradients.hess[*i]);
                b.count += 1;
            }
            local
        })
        .collect();
    while locals.len() > 1 {
        let half = locals.len() / 2;
        let upper = locals.split_off(half);
        for (l, u) in locals.iter_mut().zip(upper.iter()) {
            for (lb, ub) in l.iter_mut().zip(u.iter()) {
                lb.grad += ub.grad;
                lb.hess += ub.hess;
                lb.count += ub.count;
            }
        }
    }
    locals
        .pop()
        .unwrap_or_else(|| vec![DeviceBin::<F>::default(); n_bins])
        .into_iter()
        .map(|b| Bin {
            gradient_sum: b.grad.into_f64(),
            hessian_sum: b.hess.into_f64(),
            count: b.count,
        })
        .collect()
}

fn run_kernel(launch: &KernelLaunch) -> Vec<HistogramMatrix> {
    let features: &DeviceFeatures = &launch.features;
    let gradients: &DeviceGradients = &launch.gradients;
    let use_dp = launch.use_dp;
    launch
        .nodes
        .iter()
        .map(|index| {
            let n_workgroups =
                workgroups_for(index.len(), launch.workgroup_size, launch.max_workgroups);
            let histograms: Vec<Vec<Bin>> = (0..features.n_bins.len())
                .into_par_iter()
                .map(|col| {
                    let feature =
                        &features.bins[(col * features.rows)..((col + 1) * features.rows)];
                    let n_bins = features.n_bins[col];
                    if use_dp {
                        feature_kernel::<f64>(feature, n_bins, gradients, index, n_workgroups)
                    } else {
                        feature_kernel::<f32>(feature, n_bins, gradients, index, n_workgroups)
                    }
                })
                .collect();
            HistogramMatrix(JaggedMatrix::from_vecs(histograms))
        })
        .collect()
}

/// A software device. Kernels execute on a dedicated device thread, with
/// workgroups scheduled on the rayon pool, and device memory is accounted
/// against a fixed budget. It exposes a single platform with a single device.
pub struct SimulatedDevice {
    config: DeviceConfig,
    features: Option<Arc<DeviceFeatures>>,
    gradients: Option<Arc<DeviceGradients>>,
    memory: MemoryBudget,
    queue: Option<Sender<KernelLaunch>>,
    worker: Option<JoinHandle<()>>,
}

impl SimulatedDevice {
    /// Open the device identified by the platform and device id.
    pub fn open(config: DeviceConfig) -> Result<Self, DeviceError> {
        if config.platform_id != 0 || config.device_id != 0 {
            return Err(DeviceError::NotFound(config.platform_id, config.device_id));
        }
        let (queue, jobs) = mpsc::channel::<KernelLaunch>();
        let worker = std::thread::Builder::new()
            .name("histboost-device".to_string())
            .spawn(move || {
                for launch in jobs {
                    let result = run_kernel(&launch);
                    // The host may have dropped the pending handle.
                    let _ = launch.result.send(Ok(result));
                }
            })
            .map_err(|e| DeviceError::LaunchFailed(e.to_string()))?;
        Ok(SimulatedDevice {
            memory: MemoryBudget::new(config.memory_bytes),
            config,
            features: None,
            gradients: None,
            queue: Some(queue),
            worker: Some(worker),
        })
    }

    fn gradient_bytes(&self) -> usize {
        self.gradients
            .as_ref()
            .map(|g| (g.grad.len() + g.hess.len()) * std::mem::size_of::<f32>())
            .unwrap_or(0)
    }

    fn feature_bytes(&self) -> usize {
        self.features
            .as_ref()
            .map(|f| f.bins.len() * std::mem::size_of::<u16>())
            .unwrap_or(0)
    }
}

impl ComputeDevice for SimulatedDevice {
    fn name(&self) -> String {
        format!(
            "simulated device {} on platform {}",
            self.config.device_id, self.config.platform_id
        )
    }

    fn upload_features(&mut self, data: &BinnedDataset) -> Result<(), DeviceError> {
        self.memory.release(self.feature_bytes());
        self.features = None;
        self.memory.allocate(data.binned_data.len() * std::mem::size_of::<u16>())?;
        self.features = Some(Arc::new(DeviceFeatures {
            bins: data.binned_data.clone(),
            rows: data.rows,
            n_bins: data.n_bins(),
        }));
        Ok(())
    }

    fn upload_gradients(&mut self, gradients: &GradientBuffer) -> Result<(), DeviceError> {
        self.memory.release(self.gradient_bytes());
        self.gradients = None;
        self.memory.allocate(gradients.len() * 2 * std::mem::size_of::<f32>())?;
        self.gradients = Some(Arc::new(DeviceGradients {
            grad: gradients.grad.clone(),
            hess: gradients.hess.clone(),
        }));
        Ok(())
    }

    fn launch_histograms(&mut self, nodes: &[&[usize]]) -> Result<PendingHistograms, DeviceError> {
        let features = self
            .features
            .clone()
            .ok_or(DeviceError::FeaturesNotUploaded)?;
        let gradients = self
            .gradients
            .clone()
            .ok_or(DeviceError::GradientsNotUploaded)?;
        // The index of every node, and the output histograms, live on the device
        // for the duration of the launch.
        let index_bytes: usize = nodes.iter().map(|n| n.len()).sum::<usize>()
            * std::mem::size_of::<u32>();
        let output_bytes =
            nodes.len() * features.n_bins.iter().sum::<usize>() * std::mem::size_of::<Bin>();
        self.memory.check(index_bytes + output_bytes)?;

        let (result, receiver) = mpsc::channel();
        let launch = KernelLaunch {
            features,
            gradients,
            nodes: nodes.iter().map(|n| n.to_vec()).collect(),
            use_dp: self.config.use_dp,
            workgroup_size: self.config.workgroup_size,
            max_workgroups: self.config.max_workgroups,
            result,
        };
        self.queue
            .as_ref()
            .ok_or_else(|| DeviceError::LaunchFailed("device queue is closed".to_string()))?
            .send(launch)
            .map_err(|e| DeviceError::LaunchFailed(e.to_string()))?;
        Ok(PendingHistograms::from_channel(receiver))
    }

    fn synchronize(
        &mut self,
        pending: PendingHistograms,
    ) -> Result<Vec<HistogramMatrix>, DeviceError> {
        pending.receive()
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        // Closing the queue stops the device thread.
        self.queue = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Build histograms on a compute device.
pub struct GpuHistogramBuilder {
    device: Box<dyn ComputeDevice>,
    pub launches: usize,
}

impl GpuHistogramBuilder {
    pub fn new(device: Box<dyn ComputeDevice>) -> Self {
        GpuHistogramBuilder {
            device,
            launches: 0,
        }
    }

    /// Build the histograms of several nodes with a single kernel launch.
    pub fn build_batch(&mut self, nodes: &[&[usize]]) -> Result<Vec<HistogramMatrix>, DeviceError> {
        let pending = self.device.launch_histograms(nodes)?;
        self.launches += 1;
        self.device.synchronize(pending)
    }
}

impl HistogramBuilder for GpuHistogramBuilder {
    fn begin_session(&mut self, data: &BinnedDataset) -> Result<(), DeviceError> {
        self.device.upload_features(data)
    }

    fn begin_iteration(&mut self, gradients: &GradientBuffer) -> Result<(), DeviceError> {
        self.device.upload_gradients(gradients)
    }

    fn build(
        &mut self,
        _data: &BinnedDataset,
        _gradients: &GradientBuffer,
        index: &[usize],
    ) -> Result<HistogramMatrix, DeviceError> {
        self.build_batch(&[index])?
            .pop()
            .ok_or_else(|| DeviceError::LaunchFailed("launch returned no histograms".to_string()))
    }
}

/// Routes every histogram build to either the CPU or the device, based on the
/// number of records in the node. Device errors are recovered from by falling
/// back to the CPU for the remainder of the run.
pub struct HybridHistogramBuilder {
    cpu: CpuHistogramBuilder,
    gpu: Option<GpuHistogramBuilder>,
    threshold: usize,
    pub gpu_builds: usize,
    pub cpu_builds: usize,
}

impl HybridHistogramBuilder {
    /// Create a builder, opening the configured device if the GPU is requested.
    /// If the device cannot be opened, the CPU is used.
    pub fn new(device: DeviceType, config: DeviceConfig, threshold: usize, parallel: bool) -> Self {
        let gpu = match device {
            DeviceType::Cpu => None,
            DeviceType::Gpu => match open_device(&config) {
                Ok(d) => {
                    log::info!("Building large histograms on {}.", d.name());
                    Some(GpuHistogramBuilder::new(d))
                }
                Err(e) => {
                    log::warn!("{}, falling back to the CPU histogram builder.", e);
                    None
                }
            },
        };
        HybridHistogramBuilder::with_device(gpu, threshold, parallel)
    }

    /// Create a builder around an already opened device.
    pub fn with_device(gpu: Option<GpuHistogramBuilder>, threshold: usize, parallel: bool) -> Self {
        HybridHistogramBuilder {
            cpu: CpuHistogramBuilder::new(parallel),
            gpu,
            threshold,
            gpu_builds: 0,
            cpu_builds: 0,
        }
    }

    /// Is the device still in use.
    pub fn uses_device(&self) -> bool {
        self.gpu.is_some()
    }

    fn fall_back(&mut self, error: DeviceError) {
        if self.gpu.take().is_some() {
            log::warn!(
                "{}, falling back to the CPU histogram builder for the rest of training.",
                error
            );
        }
    }
}

impl HistogramBuilder for HybridHistogramBuilder {
    fn begin_session(&mut self, data: &BinnedDataset) -> Result<(), DeviceError> {
        if let Some(gpu) = self.gpu.as_mut() {
            if let Err(e) = gpu.begin_session(data) {
                self.fall_back(e);
            }
        }
        Ok(())
    }

    fn begin_iteration(&mut self, gradients: &GradientBuffer) -> Result<(), DeviceError> {
        if let Some(gpu) = self.gpu.as_mut() {
            if let Err(e) = gpu.begin_iteration(gradients) {
                self.fall_back(e);
            }
        }
        Ok(())
    }

    fn build(
        &mut self,
        data: &BinnedDataset,
        gradients: &GradientBuffer,
        index: &[usize],
    ) -> Result<HistogramMatrix, DeviceError> {
        if index.len() >= self.threshold {
            if let Some(gpu) = self.gpu.as_mut() {
                match gpu.build(data, gradients, index) {
                    Ok(h) => {
                        self.gpu_builds += 1;
                        return Ok(h);
                    }
                    Err(e) => self.fall_back(e),
                }
            }
        }
        self.cpu_builds += 1;
        self.cpu.build(data, gradients, index)
    }
}
