use std::path::Path;

use ndarray::prelude::*;
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use parking_lot::Mutex;
use tracing::debug;

use crate::{
    device::Device,
    errors::{Result, TileSegError},
    model::SegmentationNetwork,
};

/// A segmentation network stored as an ONNX graph.
///
/// The checkpoint is the exported graph with its trained weights. Input and
/// output tensors default to the graph's first input and output.
pub struct OnnxNetwork {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    num_channels: usize,
    num_classes: usize,
}

impl OnnxNetwork {
    pub fn load(
        checkpoint: &Path,
        device: &Device,
        num_classes: usize,
        input: Option<&str>,
        output: Option<&str>,
    ) -> Result<Self> {
        let mut session = Session::builder()
            .map_err(checkpoint_error(checkpoint, "session builder initialization"))?
            .with_execution_providers(device.execution_providers())
            .map_err(checkpoint_error(checkpoint, "execution provider registration"))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(checkpoint_error(checkpoint, "graph optimization setup"))?
            .with_memory_pattern(true)
            .map_err(checkpoint_error(checkpoint, "memory pattern setup"))?
            .commit_from_file(checkpoint)
            .map_err(checkpoint_error(checkpoint, "checkpoint load"))?;

        let input_name = pick(
            session.inputs.iter().map(|i| i.name.as_str()),
            input,
            checkpoint,
            "input",
        )?;
        let output_name = pick(
            session.outputs.iter().map(|o| o.name.as_str()),
            output,
            checkpoint,
            "output",
        )?;

        let input_shape = session
            .inputs
            .iter()
            .find(|i| i.name == input_name)
            .and_then(|i| i.input_type.tensor_shape())
            .map(|s| s.to_vec())
            .ok_or_else(|| TileSegError::checkpoint(checkpoint, "input is not a tensor"))?;
        let output_shape = session
            .outputs
            .iter()
            .find(|o| o.name == output_name)
            .and_then(|o| o.output_type.tensor_shape())
            .map(|s| s.to_vec())
            .ok_or_else(|| TileSegError::checkpoint(checkpoint, "output is not a tensor"))?;

        let (num_channels, declared_classes) =
            nchw_dims(&input_shape, &output_shape, num_classes, checkpoint)?;

        // Warm the session up when the graph fixes its spatial size.
        if let (Ok(h), Ok(w)) = (
            usize::try_from(input_shape[2]),
            usize::try_from(input_shape[3]),
        ) {
            let data = Array4::<f32>::zeros((1, num_channels, h, w));
            let tensor = TensorRef::from_array_view(&data)
                .map_err(checkpoint_error(checkpoint, "warm-up tensor"))?;
            session
                .run(ort::inputs![input_name.as_str() => tensor])
                .map_err(checkpoint_error(checkpoint, "warm-up run"))?;
        }

        debug!(
            checkpoint = %checkpoint.display(),
            input = %input_name,
            output = %output_name,
            num_channels,
            classes = declared_classes,
            "onnx session ready"
        );

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
            num_channels,
            num_classes: declared_classes,
        })
    }
}

fn checkpoint_error<'a, E: std::fmt::Display>(
    checkpoint: &'a Path,
    reason: &'static str,
) -> impl FnOnce(E) -> TileSegError + 'a {
    move |e| TileSegError::Checkpoint {
        path: checkpoint.to_path_buf(),
        reason: reason.to_string(),
        source: Some(e.to_string().into()),
    }
}

/// Channel and class counts of an NCHW graph. A dynamic (negative) class
/// dimension falls back to `num_classes`; the forward pass checks it.
fn nchw_dims(
    input_shape: &[i64],
    output_shape: &[i64],
    num_classes: usize,
    checkpoint: &Path,
) -> Result<(usize, usize)> {
    if input_shape.len() != 4 || output_shape.len() != 4 {
        return Err(TileSegError::checkpoint(
            checkpoint,
            format!("expected NCHW tensors, got input {input_shape:?} and output {output_shape:?}"),
        ));
    }
    let num_channels = usize::try_from(input_shape[1])
        .map_err(|_| TileSegError::checkpoint(checkpoint, "input channel dimension is dynamic"))?;
    let classes = usize::try_from(output_shape[1]).unwrap_or(num_classes);
    Ok((num_channels, classes))
}

fn pick<'a>(
    mut names: impl Iterator<Item = &'a str>,
    wanted: Option<&str>,
    checkpoint: &Path,
    kind: &str,
) -> Result<String> {
    match wanted {
        Some(wanted) => names
            .find(|n| *n == wanted)
            .map(str::to_string)
            .ok_or_else(|| {
                TileSegError::checkpoint(checkpoint, format!("graph has no {kind} `{wanted}`"))
            }),
        None => names
            .next()
            .map(str::to_string)
            .ok_or_else(|| TileSegError::checkpoint(checkpoint, format!("graph has no {kind}"))),
    }
}

impl SegmentationNetwork for OnnxNetwork {
    fn forward(&self, images: ArrayView4<f32>) -> Result<Array4<f32>> {
        let mut session = self.session.lock();
        let outputs = session.run(ort::inputs![
            self.input_name.as_str() => TensorRef::from_array_view(&images.as_standard_layout())?
        ])?;
        Ok(outputs[self.output_name.as_str()]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix4>()?
            .to_owned())
    }

    fn num_channels(&self) -> usize {
        self.num_channels
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }
}
