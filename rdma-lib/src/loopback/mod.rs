mod loopback_fabric;
mod loopback_qp;

pub use loopback_fabric::{
    FabricOp, LoopbackCmId, LoopbackCompChannel, LoopbackContext, LoopbackCq,
    LoopbackEventChannel, LoopbackFabric, LoopbackMr, LoopbackPd, LoopbackQp,
};
