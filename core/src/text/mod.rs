// Text handling: inline markup and punctuation segmentation

pub mod markup;
pub mod segmenter;
