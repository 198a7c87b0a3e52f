use core::fmt;

use burn::tensor::{activation::softmax, backend::Backend, ElementConversion, Tensor};

use crate::{
    classifier::Classifier,
    error::{GradCamError, Result},
};

/// Top class of a single forward pass.
#[derive(Clone, Debug, PartialEq)]
pub struct Prediction {
    pub class_index: usize,
    pub label: Option<String>,
    /// Probability of the class, in percent.
    pub percentage: f32,
}

impl fmt::Display for Prediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(
                f,
                "Predicted: {label}\nCategory Id: {}\nConfidence: {:.2}%",
                self.class_index, self.percentage
            ),
            None => write!(
                f,
                "Category Id: {}\nConfidence: {:.2}%",
                self.class_index, self.percentage
            ),
        }
    }
}

/// Classify a normalized `[1, 3, H, W]` image tensor.
pub fn predict<B: Backend>(classifier: &Classifier<B>, input: Tensor<B, 4>) -> Result<Prediction> {
    let expected = classifier.input_shape();
    let actual = input.dims();
    if actual != expected {
        return Err(GradCamError::ShapeMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        });
    }

    // Forward pass
    let probabilities = softmax(classifier.model.forward(input), 1);

    // Output class index w/ probability
    let (probability, idx) = probabilities.max_dim_with_indices(1);
    let class_index = idx.into_scalar().elem::<i64>() as usize;
    let percentage = probability.into_scalar().elem::<f32>() * 100.0;

    let prediction = Prediction {
        class_index,
        label: classifier.label(class_index).map(String::from),
        percentage,
    };
    log::info!(
        "Predicted class {} with {:.2}% confidence",
        prediction.class_index,
        prediction.percentage
    );

    Ok(prediction)
}
