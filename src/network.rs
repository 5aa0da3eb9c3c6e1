use std::path::Path;

use candle_core::{DType, Device, Error, Tensor};
use candle_nn::{Linear, Module, VarBuilder, VarMap, linear};

/// Anything that maps a `(B, obs)` batch of states to `(B, n_actions)` values.
pub trait QNetwork {
    fn q_values(&self, states: &Tensor) -> candle_core::Result<Tensor>;
}

/// Tensor cut off from the autograd graph. The only way to build one is
/// through [`Frozen::new`], which detaches, so values derived from it never
/// contribute gradients.
#[derive(Debug, Clone)]
pub struct Frozen(Tensor);

impl Frozen {
    pub fn new(tensor: &Tensor) -> Self {
        Self(tensor.detach())
    }

    pub fn tensor(&self) -> &Tensor {
        &self.0
    }

    pub fn map(
        &self,
        f: impl FnOnce(&Tensor) -> candle_core::Result<Tensor>,
    ) -> candle_core::Result<Frozen> {
        Ok(Frozen::new(&f(&self.0)?))
    }
}

pub struct MultiLayerPerceptron {
    pub layers: Vec<Linear>,
    pub var_map: VarMap,
    pub topology: Vec<usize>,
    device: Device,
}

impl MultiLayerPerceptron {
    pub fn new(topology: &[usize], device: &Device) -> candle_core::Result<Self> {
        if topology.len() < 2 {
            return Err(Error::Msg(format!(
                "topology needs at least an input and an output size, got {topology:?}"
            )));
        }
        let vm = VarMap::new();
        let vb = VarBuilder::from_varmap(&vm, DType::F32, device);
        let mut layers: Vec<Linear> = Vec::with_capacity(topology.len() - 1);

        for i in 0..(topology.len() - 1) {
            layers.push(linear(topology[i], topology[i + 1], vb.pp(i))?);
        }

        Ok(Self {
            layers,
            topology: topology.to_vec(),
            var_map: vm,
            device: device.clone(),
        })
    }

    pub fn output(&self, inputs: &Tensor) -> candle_core::Result<Tensor> {
        let mut x = inputs.clone();
        for layer in self.layers.iter().take(self.layers.len() - 1) {
            x = layer.forward(&x)?.relu()?;
        }
        if let Some(last_layer) = self.layers.last() {
            x = last_layer.forward(&x)?;
        }
        Ok(x)
    }

    /// Independent network with the same topology and a copy of this one's
    /// weights.
    pub fn try_clone(&self) -> candle_core::Result<Self> {
        let mut copy = MultiLayerPerceptron::new(&self.topology, &self.device)?;
        copy.copy_from(self)?;
        Ok(copy)
    }

    /// Overwrites every parameter with the matching one from `source`.
    pub fn copy_from(&mut self, source: &MultiLayerPerceptron) -> candle_core::Result<()> {
        if source.topology != self.topology {
            return Err(Error::Msg(format!(
                "cannot copy weights from topology {:?} into {:?}",
                source.topology, self.topology
            )));
        }
        let source_vars = source
            .var_map
            .data()
            .lock()
            .map_err(|_| Error::Msg("source var map lock poisoned".into()))?;
        let own_vars = self
            .var_map
            .data()
            .lock()
            .map_err(|_| Error::Msg("target var map lock poisoned".into()))?;

        for (name, own_var) in own_vars.iter() {
            let source_var = source_vars
                .get(name)
                .ok_or_else(|| Error::Msg(format!("missing var {name}")))?;
            own_var.set(&source_var.as_tensor().detach())?;
        }
        Ok(())
    }

    /// Snapshot of the parameters sorted by name. The tensors own their
    /// storage, so later optimizer steps do not show through.
    pub fn named_parameters(&self) -> candle_core::Result<Vec<(String, Tensor)>> {
        let vars = self
            .var_map
            .data()
            .lock()
            .map_err(|_| Error::Msg("var map lock poisoned".into()))?;
        let mut params = vars
            .iter()
            .map(|(name, var)| Ok((name.clone(), var.as_tensor().copy()?.detach())))
            .collect::<candle_core::Result<Vec<(String, Tensor)>>>()?;
        params.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(params)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> candle_core::Result<()> {
        self.var_map.save(path)
    }

    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> candle_core::Result<()> {
        self.var_map.load(path)
    }
}

impl QNetwork for MultiLayerPerceptron {
    fn q_values(&self, states: &Tensor) -> candle_core::Result<Tensor> {
        self.output(states)
    }
}

/// Second parameter set used for bootstrapped targets. It is only written
/// by a full copy from the online network and only read as [`Frozen`].
pub struct TargetNetwork<N = MultiLayerPerceptron> {
    network: N,
}

impl<N: QNetwork> TargetNetwork<N> {
    pub fn new(network: N) -> Self {
        Self { network }
    }

    pub fn evaluate(&self, states: &Tensor) -> candle_core::Result<Frozen> {
        Ok(Frozen::new(&self.network.q_values(states)?))
    }

    pub fn network(&self) -> &N {
        &self.network
    }
}

impl TargetNetwork<MultiLayerPerceptron> {
    pub fn from_online(online: &MultiLayerPerceptron) -> candle_core::Result<Self> {
        Ok(Self::new(online.try_clone()?))
    }

    pub fn sync_from(&mut self, online: &MultiLayerPerceptron) -> candle_core::Result<()> {
        self.network.copy_from(online)
    }
}
