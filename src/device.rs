use candle_core::Device;
use once_cell::sync::OnceCell;
use tracing::{info, warn};

static DEVICE: OnceCell<Device> = OnceCell::new();

/// Process-wide device, chosen by the first caller. Asking for the GPU falls
/// back to the CPU when CUDA cannot be initialized.
pub fn select(gpu: bool) -> &'static Device {
    DEVICE.get_or_init(|| {
        if !gpu {
            return Device::Cpu;
        }
        match Device::new_cuda(0) {
            Ok(device) => {
                info!("Successfully initialized CUDA device.");
                device
            }
            Err(err_cuda) => {
                warn!("Failed to initialize CUDA device: {err_cuda:?}. Falling back to CPU.");
                Device::Cpu
            }
        }
    })
}
