//! Views handed to renderers. Pure functions of the controller's state.

use frame_verdict_common::frame::FrameBatch;
use frame_verdict_common::prediction::{display_label, ConfidenceBand, PredictionRecord, Verdict};
use serde::Serialize;
use std::collections::BTreeMap;

/// URL under which the control surface serves the captured frame `index`.
pub fn frame_url(index: usize) -> String {
    format!("/frames/{index}")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridView {
    pub is_loading: bool,
    pub cards: Vec<GridCard>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum GridCard {
    Placeholder {
        index: usize,
    },
    Image {
        index: usize,
        title: String,
        url: String,
        width: u32,
        height: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        prediction: Option<CardPrediction>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CardPrediction {
    pub confidence: String,
    #[serde(rename = "classLabel")]
    pub class_label: String,
    pub display_label: String,
}

/// Image grid: `placeholders` skeleton cards while loading or before anything
/// was captured, otherwise one card per frame with its record (if any) by
/// position.
pub fn grid_view(
    batch: Option<&FrameBatch>,
    is_loading: bool,
    results: &[PredictionRecord],
    placeholders: usize,
    labels: &BTreeMap<String, String>,
) -> GridView {
    let frames = match batch {
        Some(batch) if !is_loading && !batch.is_empty() => batch.frames(),
        _ => {
            return GridView {
                is_loading,
                cards: (0..placeholders)
                    .map(|index| GridCard::Placeholder { index })
                    .collect(),
            }
        }
    };

    let cards = frames
        .iter()
        .map(|frame| {
            let (width, height) = frame.dimensions();
            GridCard::Image {
                index: frame.index(),
                title: format!("Frame {}", frame.index() + 1),
                url: frame_url(frame.index()),
                width,
                height,
                prediction: results.get(frame.index()).map(|record| CardPrediction {
                    confidence: record.confidence.to_string(),
                    class_label: record.class_label.clone(),
                    display_label: display_label(&record.class_label, labels),
                }),
            }
        })
        .collect();
    GridView { is_loading, cards }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerdictView {
    #[serde(rename = "classLabel")]
    pub class_label: String,
    pub display_label: String,
    pub confidence: String,
    pub band: ConfidenceBand,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// Final verdict card; the first captured frame stands in for the batch.
pub fn verdict_view(
    verdict: &Verdict,
    batch: Option<&FrameBatch>,
    labels: &BTreeMap<String, String>,
) -> VerdictView {
    VerdictView {
        class_label: verdict.class_label.clone(),
        display_label: display_label(&verdict.class_label, labels),
        confidence: verdict.confidence.clone(),
        band: verdict.band(),
        image_url: batch
            .and_then(|b| b.frames().first())
            .map(|frame| frame_url(frame.index())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use frame_verdict_common::frame::{Frame, Still};
    use frame_verdict_common::prediction::{aggregate, Confidence};

    fn labels() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("0".to_string(), "Non-recyclable".to_string()),
            ("1".to_string(), "Recyclable".to_string()),
        ])
    }

    fn batch(n: usize) -> FrameBatch {
        let frames = (0..n)
            .map(|i| Frame::new(Still::jpeg(Bytes::from_static(b"x"), 8, 8), 1, i))
            .collect();
        FrameBatch::new(1, frames).unwrap()
    }

    #[test]
    fn placeholders_while_loading() {
        let b = batch(3);
        let view = grid_view(Some(&b), true, &[], 5, &labels());
        assert!(view.is_loading);
        assert_eq!(view.cards.len(), 5);
        assert!(view.cards.iter().all(|c| matches!(c, GridCard::Placeholder { .. })));
    }

    #[test]
    fn placeholders_before_first_capture() {
        let view = grid_view(None, false, &[], 5, &labels());
        assert_eq!(view.cards.len(), 5);
    }

    #[test]
    fn images_carry_positional_predictions() {
        let b = batch(3);
        let results = vec![
            PredictionRecord::new(Confidence::Number(0.9), "1"),
            PredictionRecord::unknown(),
        ];
        let view = grid_view(Some(&b), false, &results, 5, &labels());
        assert_eq!(view.cards.len(), 3);
        let GridCard::Image { title, url, prediction, .. } = &view.cards[0] else {
            panic!("expected image card");
        };
        assert_eq!(title, "Frame 1");
        assert_eq!(url, "/frames/0");
        let prediction = prediction.as_ref().unwrap();
        assert_eq!(prediction.display_label, "Recyclable");
        assert_eq!(prediction.confidence, "0.9");

        let GridCard::Image { prediction, .. } = &view.cards[1] else {
            panic!("expected image card");
        };
        assert_eq!(prediction.as_ref().unwrap().confidence, "N/A");

        let GridCard::Image { prediction, .. } = &view.cards[2] else {
            panic!("expected image card");
        };
        assert!(prediction.is_none());
    }

    #[test]
    fn verdict_uses_first_frame_and_display_name() {
        let records = vec![
            PredictionRecord::new(Confidence::Number(0.9), "0"),
            PredictionRecord::new(Confidence::Number(0.7), "0"),
        ];
        let b = batch(2);
        let view = verdict_view(&aggregate(&records), Some(&b), &labels());
        assert_eq!(view.class_label, "0");
        assert_eq!(view.display_label, "Non-recyclable");
        assert_eq!(view.confidence, "80.00%");
        assert_eq!(view.band, ConfidenceBand::High);
        assert_eq!(view.image_url.as_deref(), Some("/frames/0"));
    }

    #[test]
    fn empty_verdict_has_no_image() {
        let view = verdict_view(&aggregate(&[]), None, &labels());
        assert_eq!(view.display_label, "Unknown");
        assert_eq!(view.band, ConfidenceBand::Unknown);
        assert!(view.image_url.is_none());
    }
}
