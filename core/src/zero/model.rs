//! The sharded model wrapper and its backward orchestration.

use super::config::ZeroConfig;
use super::param_manager::ParamManager;
use super::reduce_worker::ReduceWorker;
use super::sharded_param::{GradSlot, ShardedParam, get_gradient_predivide_factor};
use super::{Result, ZeroError};
use crate::checkpoint::StateDict;
use crate::distributed::{CollectiveBackend, ProcessGroup};
use crate::optim::Optimizer;
use crate::tensor::{ComputeElem, Tensor};
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingState {
    Idle,
    Forward,
    PreBackward,
    PostBackward,
    GatherFullParams,
}

/// Position of a parameter: its unit and its index inside that unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId {
    pub unit: usize,
    pub index: usize,
}

/// A group of parameters sharded, gathered and freed together.
#[derive(Debug)]
pub struct ZeroUnit<C: ComputeElem> {
    name: String,
    manager: ParamManager<C>,
    training_state: TrainingState,
    is_root: bool,
    reshard_after_forward: bool,
    require_backward_grad_sync: bool,
    pre_backward_hook_has_run: bool,
}

impl<C: ComputeElem> ZeroUnit<C> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn training_state(&self) -> TrainingState {
        self.training_state
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn reshard_after_forward(&self) -> bool {
        self.reshard_after_forward
    }

    pub fn require_backward_grad_sync(&self) -> bool {
        self.require_backward_grad_sync
    }

    pub fn params(&self) -> &[ShardedParam<C>] {
        self.manager.params()
    }

    pub fn manager(&self) -> &ParamManager<C> {
        &self.manager
    }

    fn has_trainable_params(&self) -> bool {
        self.params().iter().any(|p| p.requires_grad())
    }

    /// Panics unless the unit is in one of `expected`.
    fn assert_state(&self, expected: &[TrainingState]) {
        if !expected.contains(&self.training_state) {
            let backtrace = Backtrace::force_capture();
            error!(
                unit = %self.name,
                state = ?self.training_state,
                ?expected,
                %backtrace,
                "training state violation"
            );
            panic!(
                "unit {:?}: expected to be in states {expected:?} but current state is {:?}",
                self.name, self.training_state
            );
        }
    }

    /// Gets every `grad` slot ready for a new backward pass.
    fn prep_grads_for_backward(&mut self) -> Result<()> {
        for p in self.manager.params_mut() {
            match p.grad.take() {
                // accumulated under no_sync: keep adding to it
                Some(GradSlot::Full(g)) => p.grad = Some(GradSlot::Full(g)),
                // reduced in an earlier pass: reduce this pass separately, then add
                Some(GradSlot::Shard(s)) => match &mut p.saved_grad_shard {
                    Some(saved) => saved.accumulate(&s)?,
                    None => p.saved_grad_shard = Some(s),
                },
                None => {}
            }
        }
        Ok(())
    }
}

/// Read access to materialized full parameters during forward and backward.
pub struct FullParams<'a, C: ComputeElem> {
    units: &'a [ZeroUnit<C>],
    index: &'a HashMap<String, ParamId>,
}

impl<'a, C: ComputeElem> FullParams<'a, C> {
    fn param(&self, name: &str) -> Result<&'a ShardedParam<C>> {
        let id = self
            .index
            .get(name)
            .ok_or_else(|| ZeroError::UnknownParam(name.to_string()))?;
        Ok(&self.units[id.unit].params()[id.index])
    }

    /// The full parameter, flat and unpadded.
    pub fn get(&self, name: &str) -> Result<&'a [C]> {
        self.param(name)?
            .full_data()
            .ok_or_else(|| ZeroError::NotMaterialized(name.to_string()))
    }

    /// A copy of the full parameter in its original shape.
    pub fn tensor<const RANK: usize>(&self, name: &str) -> Result<Tensor<C, RANK>> {
        let param = self.param(name)?;
        let shape: [usize; RANK] =
            param
                .orig_shape()
                .try_into()
                .map_err(|_| ZeroError::RankMismatch {
                    name: name.to_string(),
                    shape: param.orig_shape().to_vec(),
                    rank: RANK,
                })?;
        Ok(Tensor::new(self.get(name)?.to_vec(), shape)?)
    }
}

/// A model whose parameters are sharded across a data-parallel group.
///
/// Unit 0 is the root: it alone queues the final backward callback and owns the `no_sync`
/// scope. Every rank of the group must drive the same sequence of calls.
///
/// ```rust
/// use std::sync::Arc;
/// use shard_rs::distributed::{CpuBackend, ProcessGroup};
/// use shard_rs::tensor::Tensor;
/// use shard_rs::zero::{ShardedParam, ZeroConfig, ZeroModel};
///
/// let backend = Arc::new(CpuBackend::world(1).remove(0));
/// let w = ShardedParam::<f32>::new("w", vec![2], vec![1.0, 2.0]).unwrap();
/// let mut model =
///     ZeroModel::new(vec![("root".into(), vec![w])], backend, ProcessGroup::world(1), ZeroConfig::default())
///         .unwrap();
///
/// let y: f32 = model.forward(|p| Ok(p.get("w")?.iter().sum())).unwrap();
/// assert_eq!(y, 3.0);
///
/// model
///     .backward(|_| Ok(vec![("w".to_string(), Tensor::ones([2]))]))
///     .unwrap();
/// assert_eq!(model.local_grad("w").unwrap().data(), &[1.0, 1.0]);
/// ```
pub struct ZeroModel<B: CollectiveBackend, C: ComputeElem = f32> {
    units: Vec<ZeroUnit<C>>,
    index: HashMap<String, ParamId>,
    backend: Arc<B>,
    group: ProcessGroup,
    config: ZeroConfig,
    /// Reduces gradients off the compute thread; shared by every unit, started on the first
    /// reduction.
    worker: Option<ReduceWorker<ParamId, C>>,
    predivide: f32,
    postdivide: f32,
    post_backward_callback_queued: bool,
}

impl<B: CollectiveBackend, C: ComputeElem> fmt::Debug for ZeroModel<B, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZeroModel")
            .field("units", &self.units)
            .field("group", &self.group)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<B: CollectiveBackend + 'static, C: ComputeElem> ZeroModel<B, C> {
    /// Shards every unit's parameters over `group`.
    ///
    /// # Errors
    ///
    /// Configuration errors (see [`ZeroConfig::validate`]), a compute precision `C` that differs
    /// from `config.compute_dtype`, duplicate parameter names, or a backend rank outside `group`.
    pub fn new(
        units: Vec<(String, Vec<ShardedParam<C>>)>,
        backend: Arc<B>,
        group: ProcessGroup,
        config: ZeroConfig,
    ) -> Result<Self> {
        config.validate()?;
        if C::DTYPE != config.compute_dtype {
            return Err(ZeroError::InvalidConfig(format!(
                "parameters computed in {} but compute_dtype is {}",
                C::DTYPE,
                config.compute_dtype
            )));
        }
        if units.is_empty() {
            return Err(ZeroError::InvalidConfig("a model needs a root unit".into()));
        }

        let rank = backend.rank();
        let mut index = HashMap::new();
        let mut built = Vec::with_capacity(units.len());
        for (u, (name, params)) in units.into_iter().enumerate() {
            for (i, p) in params.iter().enumerate() {
                let id = ParamId { unit: u, index: i };
                if index.insert(p.name().to_string(), id).is_some() {
                    return Err(ZeroError::DuplicateParam(p.name().to_string()));
                }
            }
            let mut manager =
                ParamManager::new(params, group.clone(), rank, config.mixed_precision)?;
            manager.shard_parameters()?;

            let is_root = u == 0;
            built.push(ZeroUnit {
                name,
                manager,
                training_state: TrainingState::Idle,
                is_root,
                reshard_after_forward: config.reshard_after_forward
                    && !(is_root && config.disable_reshard_on_root),
                require_backward_grad_sync: true,
                pre_backward_hook_has_run: false,
            });
        }

        let world_size = group.size();
        let predivide = get_gradient_predivide_factor(world_size);
        info!(
            rank,
            world_size,
            units = built.len(),
            params = index.len(),
            "sharded model"
        );

        Ok(Self {
            units: built,
            index,
            backend,
            group,
            config,
            worker: None,
            predivide,
            postdivide: world_size as f32 / predivide,
            post_backward_callback_queued: false,
        })
    }

    pub fn units(&self) -> &[ZeroUnit<C>] {
        &self.units
    }

    pub fn root(&self) -> &ZeroUnit<C> {
        &self.units[0]
    }

    pub fn config(&self) -> &ZeroConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Gradients handed to the reduce-scatter worker whose shard has not come back yet.
    pub fn pending_reductions(&self) -> usize {
        self.worker.as_ref().map_or(0, ReduceWorker::in_flight)
    }

    /// Pre- and post-divide factors applied around gradient reduction.
    pub fn gradient_divide_factors(&self) -> (f32, f32) {
        (self.predivide, self.postdivide)
    }

    pub fn param_id(&self, name: &str) -> Result<ParamId> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| ZeroError::UnknownParam(name.to_string()))
    }

    pub fn param(&self, name: &str) -> Result<&ShardedParam<C>> {
        let id = self.param_id(name)?;
        Ok(&self.units[id.unit].params()[id.index])
    }

    fn param_mut(&mut self, id: ParamId) -> &mut ShardedParam<C> {
        &mut self.units[id.unit].manager.params_mut()[id.index]
    }

    /// Local fp32 master shard of a parameter.
    pub fn local_param(&self, name: &str) -> Result<&Tensor<f32, 1>> {
        Ok(self.param(name)?.fp32_shard())
    }

    /// The reduced gradient shard, once a synced backward has finished.
    pub fn local_grad(&self, name: &str) -> Option<&Tensor<f32, 1>> {
        match self.param(name).ok()?.grad() {
            Some(GradSlot::Shard(g)) => Some(g),
            _ => None,
        }
    }

    /// Runs `f` with every unit's full parameters materialized.
    ///
    /// Units that reshard after forward release their full parameters when `f` returns; all
    /// units point their data back at the fp32 master shards.
    pub fn forward<R, F>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(&FullParams<'_, C>) -> Result<R>,
    {
        for unit in &mut self.units {
            unit.assert_state(&[TrainingState::Idle]);
            unit.training_state = TrainingState::Forward;
            unit.manager.rebuild_full_params(self.backend.as_ref())?;
            Self::register_post_backward_hooks(unit);
        }

        let output = f(&FullParams {
            units: &self.units,
            index: &self.index,
        });

        for unit in &mut self.units {
            if unit.reshard_after_forward {
                unit.manager.free_full_params(None);
                if self.config.mixed_precision {
                    unit.manager.free_fp16_shards(None);
                }
            }
            unit.manager.use_fp32_shards(None);
            unit.training_state = TrainingState::Idle;
        }
        self.post_backward_callback_queued = false;
        output
    }

    /// Marks every trainable parameter so its gradient-ready event runs the post-backward hook.
    /// A parameter already marked in this iteration stays marked once.
    fn register_post_backward_hooks(unit: &mut ZeroUnit<C>) {
        for p in unit.manager.params_mut() {
            if p.requires_grad() && !p.bwd_hook_registered {
                p.bwd_hook_registered = true;
            }
        }
    }

    /// Start of backward: gathers parameters again and prepares gradient slots.
    ///
    /// Safe to call more than once per backward; gradient preparation only runs the first time.
    pub fn pre_backward_hook(&mut self) -> Result<()> {
        // a repeated call may all-gather, and the worker must not be mid-collective then
        self.drain_reductions()?;
        for u in 0..self.units.len() {
            if self.units[u].is_root {
                self.register_final_backward_hook();
            }

            let unit = &mut self.units[u];
            if unit.reshard_after_forward {
                unit.manager.rebuild_full_params(self.backend.as_ref())?;
            } else {
                unit.manager.use_full_params()?;
            }

            if !unit.pre_backward_hook_has_run {
                unit.pre_backward_hook_has_run = true;
                unit.assert_state(&[TrainingState::Idle, TrainingState::PreBackward]);
                unit.prep_grads_for_backward()?;
            }

            if unit.training_state == TrainingState::Idle {
                unit.training_state = TrainingState::PreBackward;
            }
            unit.assert_state(&[TrainingState::PreBackward, TrainingState::PostBackward]);
        }
        Ok(())
    }

    fn register_final_backward_hook(&mut self) {
        if !self.post_backward_callback_queued {
            self.units[0].assert_state(&[TrainingState::Idle]);
            self.post_backward_callback_queued = true;
            debug!("queued final backward callback");
        }
    }

    /// Delivers the complete gradient of one parameter for this backward pass.
    ///
    /// The gradient is added to the parameter's full-sized slot; if the parameter's hook is
    /// registered, the post-backward hook then reduces it.
    pub fn grad_ready<const RANK: usize>(&mut self, name: &str, grad: Tensor<C, RANK>) -> Result<()> {
        let id = self.param_id(name)?;
        let grad = grad.flatten();
        let param = self.param_mut(id);
        if grad.size() != param.orig_numel() {
            return Err(ZeroError::GradSize {
                name: name.to_string(),
                expected: param.orig_numel(),
                got: grad.size(),
            });
        }
        match &mut param.grad {
            None => param.grad = Some(GradSlot::Full(grad)),
            Some(GradSlot::Full(acc)) => acc.accumulate(&grad)?,
            Some(GradSlot::Shard(shard)) => {
                return Err(ZeroError::GradSize {
                    name: name.to_string(),
                    expected: shard.size(),
                    got: grad.size(),
                });
            }
        }

        if param.bwd_hook_registered {
            self.post_backward_hook(id)?;
        }
        Ok(())
    }

    /// Frees the full parameter and queues its gradient for reduction.
    ///
    /// Sharded gradients are reduced on the worker thread; any reductions that already finished
    /// are folded into their parameters before returning.
    pub fn post_backward_hook(&mut self, id: ParamId) -> Result<()> {
        let mixed = self.config.mixed_precision;
        let unit = &mut self.units[id.unit];
        unit.assert_state(&[TrainingState::PreBackward, TrainingState::PostBackward]);
        unit.training_state = TrainingState::PostBackward;

        if unit.params()[id.index].grad().is_none() {
            return Ok(());
        }

        let require_sync = unit.require_backward_grad_sync;
        if require_sync || unit.reshard_after_forward {
            // kept under no_sync: the parameters do not change before the next forward
            unit.manager.free_full_params(Some(&[id.index]));
        }
        if mixed {
            unit.manager.free_fp16_shards(Some(&[id.index]));
        }
        unit.manager.use_fp32_shards(Some(&[id.index]));

        if !require_sync {
            return Ok(());
        }

        let param = &mut unit.manager.params_mut()[id.index];
        let grad = match param.grad.take() {
            Some(GradSlot::Full(g)) => g,
            other => {
                param.grad = other;
                return Ok(());
            }
        };

        let done = if param.is_sharded() {
            let worker = match self.worker.take() {
                Some(worker) => worker,
                None => ReduceWorker::spawn(
                    self.backend.clone(),
                    self.group.clone(),
                    self.config.bucket_bytes(),
                    mixed && self.config.fp32_reduce_scatter,
                    self.predivide,
                )?,
            };
            let worker = self.worker.insert(worker);
            worker.submit(id, grad)?;
            worker.try_collect()?
        } else {
            let mut grad = grad.cast::<f32>();
            if self.predivide > 1.0 {
                grad.scale(1.0 / self.predivide);
            }
            vec![(id, grad)]
        };

        for (id, shard) in done {
            self.reduce_scatter_callback(id, shard)?;
        }
        Ok(())
    }

    /// Blocks until the worker has reduced everything submitted so far and folds the results in.
    fn drain_reductions(&mut self) -> Result<()> {
        let done = match self.worker.as_mut() {
            Some(worker) if worker.has_submissions() => worker.wait()?,
            _ => Vec::new(),
        };
        for (id, shard) in done {
            self.reduce_scatter_callback(id, shard)?;
        }
        Ok(())
    }

    /// Adds a reduced shard into the parameter's saved gradient shard.
    fn reduce_scatter_callback(&mut self, id: ParamId, mut reduced: Tensor<f32, 1>) -> Result<()> {
        let postdivide = self.postdivide;
        let unit = &mut self.units[id.unit];
        unit.assert_state(&[TrainingState::PostBackward]);
        if postdivide > 1.0 {
            reduced.scale(1.0 / postdivide);
        }

        let param = &mut unit.manager.params_mut()[id.index];
        if let Some(saved) = &param.saved_grad_shard {
            if saved.size() != reduced.size() {
                return Err(ZeroError::GradSize {
                    name: param.name().to_string(),
                    expected: saved.size(),
                    got: reduced.size(),
                });
            }
        }
        match &mut param.saved_grad_shard {
            Some(saved) => saved.accumulate(&reduced)?,
            None => param.saved_grad_shard = Some(reduced),
        }
        Ok(())
    }

    /// End of the outermost backward: flushes pending reductions and installs gradient shards.
    pub fn final_backward_hook(&mut self) -> Result<()> {
        let root = &self.units[0];
        if root.has_trainable_params() {
            root.assert_state(&[TrainingState::PostBackward]);
        } else {
            root.assert_state(&[TrainingState::PreBackward]);
        }

        if root.require_backward_grad_sync {
            // wait for the worker before any gradient shard is read
            self.drain_reductions()?;
        }

        for unit in &mut self.units {
            let sync = unit.require_backward_grad_sync;
            for p in unit.manager.params_mut() {
                if !p.requires_grad() {
                    continue;
                }
                p.bwd_hook_registered = false;
                // unsynced passes keep the full grad and the last synced shard apart
                if !sync {
                    continue;
                }
                if let Some(saved) = p.saved_grad_shard.take() {
                    p.grad = Some(GradSlot::Shard(saved));
                }
            }

            unit.pre_backward_hook_has_run = false;
            if unit.has_trainable_params() {
                unit.assert_state(&[TrainingState::PostBackward]);
            } else {
                unit.assert_state(&[TrainingState::PreBackward, TrainingState::Idle]);
            }
            unit.training_state = TrainingState::Idle;
        }
        self.post_backward_callback_queued = false;
        debug!("backward finished");
        Ok(())
    }

    /// Runs one backward pass: `f` receives the full parameters and returns the full gradient
    /// of every parameter that received one.
    pub fn backward<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&FullParams<'_, C>) -> Result<Vec<(String, Tensor<C, 1>)>>,
    {
        self.pre_backward_hook()?;
        let grads = f(&FullParams {
            units: &self.units,
            index: &self.index,
        })?;
        for (name, grad) in grads {
            self.grad_ready(&name, grad)?;
        }
        self.final_backward_hook()
    }

    /// Disables gradient reduction on every unit until the guard drops.
    ///
    /// # Panics
    ///
    /// Panics if the model is not idle.
    pub fn no_sync(&mut self) -> NoSyncGuard<'_, B, C> {
        self.units[0].assert_state(&[TrainingState::Idle]);
        let old_flags = self
            .units
            .iter_mut()
            .map(|unit| std::mem::replace(&mut unit.require_backward_grad_sync, false))
            .collect();
        NoSyncGuard {
            model: self,
            old_flags,
        }
    }

    pub fn zero_grad(&mut self) {
        for unit in &mut self.units {
            for p in unit.manager.params_mut() {
                p.grad = None;
                p.saved_grad_shard = None;
            }
        }
    }

    /// Updates every master shard that has a reduced gradient. Returns how many were updated.
    pub fn step<O: Optimizer<f32>>(&mut self, optimizer: &O) -> Result<usize> {
        self.units[0].assert_state(&[TrainingState::Idle]);
        let mut updated = 0;
        for unit in &mut self.units {
            for p in unit.manager.params_mut() {
                let ShardedParam {
                    fp32_shard, grad, ..
                } = p;
                if let Some(GradSlot::Shard(g)) = grad {
                    optimizer.update(fp32_shard, g)?;
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }

    /// Gathers the unpadded fp32 value of every parameter, on every rank.
    pub fn full_state_dict(&mut self) -> Result<StateDict> {
        for unit in &mut self.units {
            unit.assert_state(&[TrainingState::Idle]);
            unit.training_state = TrainingState::GatherFullParams;
        }
        let mut state = StateDict::new();
        let mut result = Ok(());
        for unit in &self.units {
            match unit.manager.gather_fp32_params(self.backend.as_ref()) {
                Ok(entries) => state.extend(entries),
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        for unit in &mut self.units {
            unit.training_state = TrainingState::Idle;
        }
        result.map(|()| state)
    }

    /// Replaces every master shard with this rank's chunk of a full state dict.
    pub fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        self.units[0].assert_state(&[TrainingState::Idle]);
        let world_size = self.group.size();
        for unit in &mut self.units {
            let rank = unit.manager.group_rank();
            for p in unit.manager.params_mut() {
                let entry = state
                    .get(p.name())
                    .ok_or_else(|| ZeroError::MissingState(p.name().to_string()))?;
                if entry.shape != p.orig_shape() {
                    return Err(ZeroError::ParamSize {
                        name: p.name().to_string(),
                        shape: p.orig_shape().to_vec(),
                        expected: p.orig_numel(),
                        got: entry.data.size(),
                    });
                }
                p.load_full(&entry.data, rank, world_size)?;
            }
        }
        Ok(())
    }
}

/// Restores every unit's gradient-sync flag when dropped, including on unwind.
pub struct NoSyncGuard<'a, B: CollectiveBackend, C: ComputeElem> {
    model: &'a mut ZeroModel<B, C>,
    old_flags: Vec<bool>,
}

impl<B: CollectiveBackend, C: ComputeElem> Deref for NoSyncGuard<'_, B, C> {
    type Target = ZeroModel<B, C>;

    fn deref(&self) -> &Self::Target {
        &*self.model
    }
}

impl<B: CollectiveBackend, C: ComputeElem> DerefMut for NoSyncGuard<'_, B, C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.model
    }
}

impl<B: CollectiveBackend, C: ComputeElem> Drop for NoSyncGuard<'_, B, C> {
    fn drop(&mut self) {
        for (unit, old) in self.model.units.iter_mut().zip(&self.old_flags) {
            debug_assert!(!unit.require_backward_grad_sync);
            unit.require_backward_grad_sync = *old;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::CpuBackend;
    use crate::optim::Sgd;
    use crate::tensor::DType;
    use half::bf16;

    fn single(config: ZeroConfig) -> ZeroModel<CpuBackend> {
        let backend = Arc::new(CpuBackend::world(1).remove(0));
        let units = vec![
            (
                "root".to_string(),
                vec![ShardedParam::new("w", vec![2], vec![1.0, 2.0]).unwrap()],
            ),
            (
                "block".to_string(),
                vec![
                    ShardedParam::new("v", vec![3], vec![1.0, 1.0, 1.0]).unwrap(),
                    ShardedParam::new("frozen", vec![1], vec![7.0])
                        .unwrap()
                        .frozen(),
                ],
            ),
        ];
        ZeroModel::new(units, backend, ProcessGroup::world(1), config).unwrap()
    }

    fn grads(scale: f32) -> Vec<(String, Tensor<f32, 1>)> {
        vec![
            ("w".to_string(), Tensor::new(vec![scale, scale], [2]).unwrap()),
            ("v".to_string(), Tensor::new(vec![scale; 3], [3]).unwrap()),
        ]
    }

    #[test]
    fn test_state_cycle() {
        let mut model = single(ZeroConfig::default());
        assert!(!model.root().reshard_after_forward());
        assert!(model.units()[1].reshard_after_forward());

        model.forward(|p| Ok(p.tensor::<1>("v")?.sum())).unwrap();
        // root keeps its full params, the inner unit freed them
        assert!(!model.param("w").unwrap().full().is_null());
        assert!(model.param("v").unwrap().full().is_null());
        assert!(model.param("v").unwrap().bwd_hook_registered());
        assert!(!model.param("frozen").unwrap().bwd_hook_registered());

        model.pre_backward_hook().unwrap();
        assert_eq!(model.root().training_state(), TrainingState::PreBackward);
        model.grad_ready("w", Tensor::<f32, 1>::ones([2])).unwrap();
        assert_eq!(model.root().training_state(), TrainingState::PostBackward);
        model.grad_ready("v", Tensor::<f32, 1>::ones([3])).unwrap();
        model.final_backward_hook().unwrap();

        assert!(model.units().iter().all(|u| u.training_state() == TrainingState::Idle));
        assert!(!model.param("v").unwrap().bwd_hook_registered());
        assert_eq!(model.local_grad("v").unwrap().data(), &[1.0; 3]);
        assert!(model.local_grad("frozen").is_none());
    }

    #[test]
    fn test_step_updates_shards() {
        let mut model = single(ZeroConfig::default());
        model.forward(|_| Ok(())).unwrap();
        model.backward(|_| Ok(grads(1.0))).unwrap();
        let updated = model.step(&Sgd::new(0.5)).unwrap();
        assert_eq!(updated, 2);
        assert_eq!(model.local_param("w").unwrap().data(), &[0.5, 1.5]);
        assert_eq!(model.local_param("frozen").unwrap().data(), &[7.0]);
    }

    #[test]
    fn test_grad_accumulates_across_synced_passes() {
        let mut model = single(ZeroConfig::default());
        for scale in [1.0, 2.0] {
            model.forward(|_| Ok(())).unwrap();
            model.backward(|_| Ok(grads(scale))).unwrap();
        }
        assert_eq!(model.local_grad("w").unwrap().data(), &[3.0, 3.0]);
        model.zero_grad();
        assert!(model.local_grad("w").is_none());
    }

    #[test]
    fn test_no_sync_restores_flags() {
        let mut model = single(ZeroConfig::default());
        {
            let mut guard = model.no_sync();
            assert!(!guard.root().require_backward_grad_sync());
            guard.forward(|_| Ok(())).unwrap();
            guard.backward(|_| Ok(grads(1.0))).unwrap();
            // unreduced: still full-sized
            assert!(matches!(
                guard.param("w").unwrap().grad(),
                Some(GradSlot::Full(_))
            ));
        }
        assert!(model.units().iter().all(|u| u.require_backward_grad_sync()));
        model.forward(|_| Ok(())).unwrap();
        model.backward(|_| Ok(grads(1.0))).unwrap();
        assert_eq!(model.local_grad("w").unwrap().data(), &[2.0, 2.0]);
    }

    #[test]
    fn test_unknown_and_misshaped_grads() {
        let mut model = single(ZeroConfig::default());
        model.forward(|_| Ok(())).unwrap();
        model.pre_backward_hook().unwrap();
        assert!(matches!(
            model.grad_ready("nope", Tensor::<f32, 1>::ones([1])),
            Err(ZeroError::UnknownParam(_))
        ));
        assert!(matches!(
            model.grad_ready("w", Tensor::<f32, 1>::ones([5])),
            Err(ZeroError::GradSize { expected: 2, got: 5, .. })
        ));
    }

    #[test]
    #[should_panic(expected = "expected to be in states")]
    fn test_post_backward_without_pre_backward_panics() {
        let mut model = single(ZeroConfig::default());
        model.forward(|_| Ok(())).unwrap();
        let _ = model.grad_ready("w", Tensor::<f32, 1>::ones([2]));
    }

    #[test]
    #[should_panic(expected = "expected to be in states")]
    fn test_forward_during_backward_panics() {
        let mut model = single(ZeroConfig::default());
        model.forward(|_| Ok(())).unwrap();
        model.pre_backward_hook().unwrap();
        let _ = model.forward(|_| Ok(()));
    }

    #[test]
    fn test_compute_dtype_must_match() {
        let backend = Arc::new(CpuBackend::world(1).remove(0));
        let units = vec![(
            "root".to_string(),
            vec![ShardedParam::<bf16>::new("w", vec![1], vec![1.0]).unwrap()],
        )];
        let err = ZeroModel::new(
            units,
            backend,
            ProcessGroup::world(1),
            ZeroConfig::mixed(DType::F16),
        )
        .unwrap_err();
        assert!(matches!(err, ZeroError::InvalidConfig(_)));
    }

    #[test]
    fn test_mixed_precision_backward() {
        let backend = Arc::new(CpuBackend::world(1).remove(0));
        let units = vec![(
            "root".to_string(),
            vec![ShardedParam::<bf16>::new("w", vec![2], vec![1.0, 2.0]).unwrap()],
        )];
        let config = ZeroConfig {
            fp32_reduce_scatter: true,
            ..ZeroConfig::mixed(DType::BF16)
        };
        let mut model = ZeroModel::new(units, backend, ProcessGroup::world(1), config).unwrap();
        let full = model.forward(|p| Ok(p.get("w")?.to_vec())).unwrap();
        assert_eq!(full, vec![bf16::from_f32(1.0), bf16::from_f32(2.0)]);

        model
            .backward(|_| {
                Ok(vec![(
                    "w".to_string(),
                    Tensor::new(vec![bf16::from_f32(0.5), bf16::from_f32(0.25)], [2])?,
                )])
            })
            .unwrap();
        assert_eq!(model.local_grad("w").unwrap().data(), &[0.5, 0.25]);
    }

    #[test]
    fn test_state_dict_round_trip() {
        let mut model = single(ZeroConfig::default());
        let state = model.full_state_dict().unwrap();
        assert_eq!(state["v"].shape, vec![3]);

        let mut changed = state.clone();
        if let Some(entry) = changed.get_mut("w") {
            entry.data = Tensor::new(vec![9.0, 8.0], [2]).unwrap();
        }
        model.load_state_dict(&changed).unwrap();
        assert_eq!(model.local_param("w").unwrap().data(), &[9.0, 8.0]);
        assert_eq!(model.root().training_state(), TrainingState::Idle);
    }
}
