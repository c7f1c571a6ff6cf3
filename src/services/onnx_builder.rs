// ONNX Runtime session builder with hardware acceleration detection

use anyhow::{Context, Result};
use ort::execution_providers::CPUExecutionProvider;
use ort::session::{builder::GraphOptimizationLevel, Session};
use std::path::Path;
use tracing::{debug, info, warn};

#[cfg(feature = "tensorrt")]
use ort::execution_providers::TensorRTExecutionProvider;

#[cfg(feature = "cuda")]
use ort::execution_providers::CUDAExecutionProvider;

/// Calculate optimal thread count for ONNX Runtime CPU inference.
///
/// Windows loses throughput to thread synchronization past ~6 threads,
/// see https://github.com/microsoft/onnxruntime/issues/3713
fn optimal_intra_op_threads() -> usize {
    let total_cores = num_cpus::get();

    #[cfg(target_os = "windows")]
    let optimal = std::cmp::min(6, total_cores).max(1);

    #[cfg(not(target_os = "windows"))]
    let optimal = total_cores.max(1);

    debug!("CPU threads: {} total cores, using {} for inference", total_cores, optimal);
    optimal
}

/// Build an ONNX Runtime session for one model file.
///
/// Tries acceleration providers in this order, using only those compiled in:
/// 1. TensorRT (NVIDIA GPUs, best performance)
/// 2. CUDA (NVIDIA GPUs)
/// 3. CPU (fallback)
///
/// `forced_backend` pins one provider ("cpu", "cuda", "tensorrt"); "auto"
/// or `None` runs detection.
///
/// # Returns
/// (backend_name, Session)
pub fn build_session(
    model_path: &Path,
    model_name: &str,
    forced_backend: Option<&str>,
) -> Result<(String, Session)> {
    if !model_path.exists() {
        anyhow::bail!(
            "{} model not found at {}",
            model_name,
            model_path.display()
        );
    }

    if let Some(forced) = forced_backend {
        if !forced.is_empty() && !forced.eq_ignore_ascii_case("auto") {
            info!("INFERENCE_BACKEND={}, forcing specific backend for {}", forced, model_name);
            return try_forced_backend(forced, model_path, model_name);
        }
    }

    #[cfg(feature = "tensorrt")]
    {
        if let Ok(session) = Session::builder()
            .and_then(|b| b.with_execution_providers([TensorRTExecutionProvider::default().build()]))
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(optimal_intra_op_threads()))
            .and_then(|b| b.with_inter_threads(1))
            .and_then(|b| b.commit_from_file(model_path))
        {
            info!("✓ Using TensorRT acceleration for {}", model_name);
            return Ok(("TensorRT".to_string(), session));
        }
    }

    #[cfg(feature = "cuda")]
    {
        if let Ok(session) = Session::builder()
            .and_then(|b| b.with_execution_providers([CUDAExecutionProvider::default().build()]))
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(optimal_intra_op_threads()))
            .and_then(|b| b.with_inter_threads(1))
            .and_then(|b| b.commit_from_file(model_path))
        {
            info!("✓ Using CUDA acceleration for {}", model_name);
            return Ok(("CUDA".to_string(), session));
        }
    }

    let session = cpu_session(model_path, model_name)?;
    warn!("⚠️  Using CPU-only inference for {} (no GPU acceleration available)", model_name);
    Ok(("CPU".to_string(), session))
}

fn cpu_session(model_path: &Path, model_name: &str) -> Result<Session> {
    Session::builder()
        .context(format!("Failed to create ONNX session builder for {}", model_name))?
        .with_execution_providers([CPUExecutionProvider::default().build()])
        .context(format!("Failed to configure CPU execution provider for {}", model_name))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .context(format!("Failed to set graph optimization level for {}", model_name))?
        .with_intra_threads(optimal_intra_op_threads())
        .context(format!("Failed to configure intra-op threads for {}", model_name))?
        .with_inter_threads(1)
        .context(format!("Failed to configure inter-op threads for {}", model_name))?
        .commit_from_file(model_path)
        .context(format!(
            "Failed to load {} ONNX model from {}. \
            This usually indicates:\n  \
            1. Incomplete or corrupted export\n  \
            2. ONNX Runtime version/platform mismatch\n  \
            3. Model exported with an incompatible opset version",
            model_name,
            model_path.display()
        ))
}

/// Try to force a specific backend (for testing/debugging)
fn try_forced_backend(
    backend: &str,
    model_path: &Path,
    model_name: &str,
) -> Result<(String, Session)> {
    match backend.to_lowercase().as_str() {
        #[cfg(feature = "cuda")]
        "cuda" => {
            let session = Session::builder()
                .context("Failed to create session builder")?
                .with_execution_providers([CUDAExecutionProvider::default().build()])
                .context("Failed to configure CUDA provider")?
                .with_optimization_level(GraphOptimizationLevel::Level3)
                .context("Failed to set optimization level")?
                .with_intra_threads(optimal_intra_op_threads())
                .context("Failed to configure intra-op threads")?
                .with_inter_threads(1)
                .context("Failed to configure inter-op threads")?
                .commit_from_file(model_path)
                .context("Failed to load model with CUDA")?;
            info!("✓ Forced CUDA backend for {}", model_name);
            Ok(("CUDA".to_string(), session))
        }

        #[cfg(feature = "tensorrt")]
        "tensorrt" => {
            let session = Session::builder()
                .context("Failed to create session builder")?
                .with_execution_providers([TensorRTExecutionProvider::default().build()])
                .context("Failed to configure TensorRT provider")?
                .with_optimization_level(GraphOptimizationLevel::Level3)
                .context("Failed to set optimization level")?
                .with_intra_threads(optimal_intra_op_threads())
                .context("Failed to configure intra-op threads")?
                .with_inter_threads(1)
                .context("Failed to configure inter-op threads")?
                .commit_from_file(model_path)
                .context("Failed to load model with TensorRT")?;
            info!("✓ Forced TensorRT backend for {}", model_name);
            Ok(("TensorRT".to_string(), session))
        }

        "cpu" => {
            let session = cpu_session(model_path, model_name)?;
            info!("✓ Forced CPU backend for {}", model_name);
            Ok(("CPU".to_string(), session))
        }

        _ => {
            warn!("Unknown backend '{}', falling back to auto-detection for {}", backend, model_name);
            build_session(model_path, model_name, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_model_is_reported() {
        let err = build_session(Path::new("/nonexistent/unet.onnx"), "unet", Some("cpu"))
            .unwrap_err();
        assert!(err.to_string().contains("unet model not found"));
    }

    #[test]
    fn test_thread_count_positive() {
        assert!(optimal_intra_op_threads() >= 1);
    }
}
