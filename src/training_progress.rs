//! Training and evaluation progress information.

use camino::{Utf8Path, Utf8PathBuf};
use hdrhistogram::Histogram;
use owo_colors::{AnsiColors, OwoColorize};
use snafu::{ResultExt, Snafu};

use crate::service::SPAM_THRESHOLD;

/// Class names in the reports, the negative class first.
pub const CLASS_NAMES: [&str; 2] = ["Normal", "Spam"];

/// Counts of correct and wrong predictions at a fixed threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfusionMatrix {
    /// Threshold in percents.
    threshold: u8,
    /// Spam predicted as spam.
    pub true_positives: u64,
    /// Normal messages predicted as spam.
    pub false_positives: u64,
    /// Normal messages predicted as normal.
    pub true_negatives: u64,
    /// Spam predicted as normal.
    pub false_negatives: u64,
}

impl Default for ConfusionMatrix {
    fn default() -> Self {
        Self::with_threshold(SPAM_THRESHOLD)
    }
}

/// Division that treats `0 / 0` as zero.
fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.
    } else {
        numerator as f64 / denominator as f64
    }
}

fn f1(precision: f64, recall: f64) -> f64 {
    if precision + recall == 0. {
        0.
    } else {
        2. * precision * recall / (precision + recall)
    }
}

impl ConfusionMatrix {
    /// An empty matrix. Probabilities strictly above the threshold are
    /// considered a spam.
    pub fn with_threshold(threshold: f32) -> Self {
        Self {
            threshold: (threshold.clamp(0., 1.) * 100.).round() as u8,
            true_positives: 0,
            false_positives: 0,
            true_negatives: 0,
            false_negatives: 0,
        }
    }

    /// The threshold.
    pub fn threshold(&self) -> f32 {
        f32::from(self.threshold) / 100.
    }

    /// Records a prediction.
    pub fn record(&mut self, is_spam: bool, probability: f32) {
        let predicted_spam = probability > self.threshold();
        match (is_spam, predicted_spam) {
            (true, true) => self.true_positives += 1,
            (true, false) => self.false_negatives += 1,
            (false, true) => self.false_positives += 1,
            (false, false) => self.true_negatives += 1,
        }
    }

    /// The amount of recorded predictions.
    pub fn total(&self) -> u64 {
        self.true_positives + self.false_positives + self.true_negatives + self.false_negatives
    }

    /// Share of correct predictions.
    pub fn accuracy(&self) -> f64 {
        ratio(self.true_positives + self.true_negatives, self.total())
    }

    /// Metrics of a single class: spam when `spam` is set, normal otherwise.
    pub fn class_metrics(&self, spam: bool) -> ClassMetrics {
        let (hits, false_alarms, misses) = if spam {
            (self.true_positives, self.false_positives, self.false_negatives)
        } else {
            (self.true_negatives, self.false_negatives, self.false_positives)
        };
        let precision = ratio(hits, hits + false_alarms);
        let recall = ratio(hits, hits + misses);
        ClassMetrics {
            precision,
            recall,
            f1: f1(precision, recall),
            support: hits + misses,
        }
    }

    /// Builds a per-class report.
    pub fn report(&self) -> ClassificationReport {
        let classes = [self.class_metrics(false), self.class_metrics(true)];
        let total = self.total();

        let macro_avg = ClassMetrics {
            precision: classes.iter().map(|c| c.precision).sum::<f64>() / 2.,
            recall: classes.iter().map(|c| c.recall).sum::<f64>() / 2.,
            f1: classes.iter().map(|c| c.f1).sum::<f64>() / 2.,
            support: total,
        };
        let weighted = |metric: fn(&ClassMetrics) -> f64| {
            classes
                .iter()
                .map(|c| metric(c) * c.support as f64)
                .sum::<f64>()
                / (total.max(1) as f64)
        };
        let weighted_avg = ClassMetrics {
            precision: weighted(|c| c.precision),
            recall: weighted(|c| c.recall),
            f1: weighted(|c| c.f1),
            support: total,
        };
        ClassificationReport {
            classes,
            accuracy: self.accuracy(),
            macro_avg,
            weighted_avg,
        }
    }
}

impl std::fmt::Display for ConfusionMatrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const WIDTH: usize = 10;
        writeln!(f, "Confusion matrix (t = {:.2}):", self.threshold())?;
        writeln!(
            f,
            "{:>WIDTH$} {:>WIDTH$} {:>WIDTH$}",
            "", "→ Normal", "→ Spam"
        )?;
        writeln!(
            f,
            "{:>WIDTH$} {:>WIDTH$} {:>WIDTH$}",
            CLASS_NAMES[0], self.true_negatives, self.false_positives
        )?;
        write!(
            f,
            "{:>WIDTH$} {:>WIDTH$} {:>WIDTH$}",
            CLASS_NAMES[1], self.false_negatives, self.true_positives
        )
    }
}

/// Precision, recall and F1 of a class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassMetrics {
    /// Share of correct predictions among the predictions of the class.
    pub precision: f64,
    /// Share of the class members found.
    pub recall: f64,
    /// Harmonic mean of precision and recall.
    pub f1: f64,
    /// Amount of the class members.
    pub support: u64,
}

/// Per-class metrics with averages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassificationReport {
    /// Normal, then spam.
    pub classes: [ClassMetrics; 2],
    /// Overall accuracy.
    pub accuracy: f64,
    /// Unweighted mean over the classes.
    pub macro_avg: ClassMetrics,
    /// Mean weighted by the support.
    pub weighted_avg: ClassMetrics,
}

impl std::fmt::Display for ClassificationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const NAME: usize = 12;
        const CELL: usize = 10;
        let row = |f: &mut std::fmt::Formatter<'_>, name: &str, m: &ClassMetrics| {
            writeln!(
                f,
                "{name:>NAME$}{:>CELL$.2}{:>CELL$.2}{:>CELL$.2}{:>CELL$}",
                m.precision, m.recall, m.f1, m.support
            )
        };

        writeln!(
            f,
            "{:>NAME$}{:>CELL$}{:>CELL$}{:>CELL$}{:>CELL$}\n",
            "", "precision", "recall", "f1-score", "support"
        )?;
        for (name, metrics) in CLASS_NAMES.iter().zip(&self.classes) {
            row(f, name, metrics)?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "{:>NAME$}{:>CELL$}{:>CELL$}{:>CELL$.2}{:>CELL$}",
            "accuracy", "", "", self.accuracy, self.macro_avg.support
        )?;
        row(f, "macro avg", &self.macro_avg)?;
        row(f, "weighted avg", &self.weighted_avg)
    }
}

/// Threshold histograms.
#[derive(Debug, Clone)]
pub struct ThresholdInfo {
    /// What "spam" messages are labeled as.
    pub spam: Histogram<u32>,
    /// What "ham" messages are labeled as.
    pub not_spam: Histogram<u32>,
}

impl Default for ThresholdInfo {
    fn default() -> Self {
        let hist = Histogram::<u32>::new_with_max(100, 2).expect("Constant bounds are valid");
        Self {
            spam: hist.clone(),
            not_spam: hist,
        }
    }
}

impl ThresholdInfo {
    /// Records spam prediction.
    pub fn record_prediction(&mut self, is_spam: bool, prediction: f32) {
        let percent = (prediction.clamp(0., 1.) * 100.).round() as u64;
        if is_spam {
            self.spam.saturating_record(percent);
        } else {
            self.not_spam.saturating_record(percent);
        }
    }

    /// Finds the threshold that gives the best F-β score.
    pub fn best(&self, beta: f64) -> (u64, f64) {
        let range = 1..=99;
        range
            .clone()
            .zip(self.f_beta_list(range, beta))
            .max_by(|(_, x), (_, y)| x.total_cmp(y))
            .unwrap_or((50, 0.))
    }

    /// Returns precision and recall at the given threshold.
    pub fn precision_and_recall(&self, threshold: f64) -> (f64, f64) {
        let threshold = (threshold * 100.).round() as u64;

        let real_spam_count = self.spam.len();
        let real_ham_count = self.not_spam.len();

        // Share of spam scored below the threshold, i.e. missed.
        let spam_failure = self.spam.quantile_below(threshold);
        let true_positives = (real_spam_count as f64 * (1. - spam_failure)).round() as u64;
        let false_negatives = (real_spam_count as f64 * spam_failure).round() as u64;

        // Share of ham scored at or above the threshold.
        let ham_failure = 1. - self.not_spam.quantile_below(threshold);
        let false_positives = (real_ham_count as f64 * ham_failure).round() as u64;

        let precision = ratio(true_positives, true_positives + false_positives);
        let recall = ratio(true_positives, true_positives + false_negatives);
        (precision, recall)
    }

    fn f_beta_list<'a, I>(&'a self, thresholds: I, beta: f64) -> impl Iterator<Item = f64> + 'a
    where
        I: IntoIterator<Item = u64>,
        I::IntoIter: 'a,
    {
        let beta_squared = beta * beta;
        self.precision_and_recall_list(thresholds)
            .map(move |(precision, recall)| {
                let denominator = beta_squared * precision + recall;
                if denominator == 0. {
                    0.
                } else {
                    (1. + beta_squared) * precision * recall / denominator
                }
            })
    }

    /// Computes precision and recall for each provided threshold.
    fn precision_and_recall_list<'a, I>(
        &'a self,
        thresholds: I,
    ) -> impl Iterator<Item = (f64, f64)> + 'a
    where
        I: IntoIterator<Item = u64>,
        I::IntoIter: 'a,
    {
        thresholds
            .into_iter()
            .map(|threshold| self.precision_and_recall(threshold as f64 / 100.))
    }
}

impl std::fmt::Display for ThresholdInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let thresholds = [10, 20, 30, 40, 50, 60, 70, 80, 90];

        let (precisions, recalls): (Vec<_>, Vec<_>) =
            self.precision_and_recall_list(thresholds).unzip();

        writeln!(f, "Precision and recall with respect to a threshold")?;
        const FIRST_WIDTH: usize = 9;
        const WIDTH: usize = 7;

        write!(f, "|{: >FIRST_WIDTH$}|", "")?;
        thresholds.into_iter().try_for_each(|threshold| {
            let threshold = threshold as f32 / 100.;
            write!(f, "{: ^WIDTH$}|", format!("t={threshold:.1}"))
        })?;
        writeln!(f)?;

        write!(f, "|{:->FIRST_WIDTH$}|", "")?;
        thresholds
            .into_iter()
            .try_for_each(|_threshold| write!(f, "{:-^WIDTH$}|", ""))?;
        writeln!(f)?;

        write_row(f, "Precision", precisions)?;
        write_row(f, "Recall", recalls)?;
        write_row(f, "F1", self.f_beta_list(thresholds, 1.0))?;
        write_row(f, "F0.5", self.f_beta_list(thresholds, 0.5))?;
        write_row(f, "F2", self.f_beta_list(thresholds, 2.))
    }
}

/// Writes a table row of percentages.
fn write_row<I>(f: &mut std::fmt::Formatter<'_>, name: &str, values: I) -> std::fmt::Result
where
    I: IntoIterator<Item = f64>,
{
    const FIRST_WIDTH: usize = 9;
    const WIDTH: usize = 7;
    write!(f, "|{name:^FIRST_WIDTH$}|")?;
    values
        .into_iter()
        .try_for_each(|value| write!(f, "{:^WIDTH$}|", format!("{:.2}%", value * 100.)))?;
    writeln!(f)
}

/// Validation results of a single epoch.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// Average loss on the validation set.
    pub loss: f32,
    /// Predictions at the default threshold.
    pub matrix: ConfusionMatrix,
    /// Predictions at every threshold.
    pub thresholds: ThresholdInfo,
}

impl Evaluation {
    /// An empty evaluation.
    pub fn new() -> Self {
        Self {
            loss: 0.,
            matrix: ConfusionMatrix::default(),
            thresholds: ThresholdInfo::default(),
        }
    }

    /// Records a prediction.
    pub fn record(&mut self, is_spam: bool, probability: f32) {
        self.matrix.record(is_spam, probability);
        self.thresholds.record_prediction(is_spam, probability);
    }
}

impl Default for Evaluation {
    fn default() -> Self {
        Self::new()
    }
}

/// Training and evaluation progress information accumulator and printer.
pub struct EpochReportRecorder {
    /// Loss to amount of training samples.
    loss: Vec<(usize, f32)>,
    /// Batch accuracy to amount of training samples.
    accuracy: Vec<(usize, f32)>,
    /// How learning rate changes within the epoch.
    learning_rate: Vec<(usize, f64)>,
    /// The amount of training samples (un-batched).
    samples_count: usize,
    /// Epoch number.
    epoch: usize,
    /// The amount of processed data samples so far.
    samples_processed: usize,
    /// Correctly classified training samples.
    correct: usize,
}

impl EpochReportRecorder {
    /// Initializes an empty progress information.
    pub fn new(epoch: usize, samples_count: usize) -> Self {
        Self {
            samples_count,
            epoch,
            loss: vec![],
            accuracy: vec![],
            learning_rate: vec![],
            samples_processed: 0,
            correct: 0,
        }
    }

    /// Records a feed forward loss on the given amount of samples, `correct`
    /// of which were classified correctly.
    pub fn record(&mut self, samples: usize, correct: usize, learning_rate: f64, loss: f32) {
        self.samples_processed += samples;
        self.correct += correct;
        self.loss.push((self.samples_processed, loss));
        self.accuracy
            .push((self.samples_processed, ratio(correct as u64, samples as u64) as f32));
        self.learning_rate
            .push((self.samples_processed, learning_rate));
    }

    /// Computes the average loss within the epoch.
    pub fn avg_loss(&self) -> f32 {
        if self.loss.is_empty() {
            return 0.;
        }
        let loss_sum = self.loss.iter().map(|(_, value)| *value).sum::<f32>();
        loss_sum / self.loss.len() as f32
    }

    /// Training accuracy within the epoch.
    pub fn accuracy(&self) -> f64 {
        ratio(self.correct as u64, self.samples_processed as u64)
    }

    /// The epoch number.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Finalizes the epoch with the validation results and the predictions
    /// for a few verification samples.
    pub fn finalize<S>(self, evaluation: Evaluation, samples: S) -> EpochReport<String>
    where
        S: IntoIterator<Item = (String, f32)>,
    {
        EpochReport {
            info: self,
            samples: samples.into_iter().collect(),
            evaluation,
        }
    }
}

/// A finalized training epoch report.
pub struct EpochReport<Sample> {
    info: EpochReportRecorder,
    samples: Vec<(Sample, f32)>,
    evaluation: Evaluation,
}

impl<Sample> EpochReport<Sample> {
    /// The validation results.
    pub fn evaluation(&self) -> &Evaluation {
        &self.evaluation
    }

    /// The epoch number.
    pub fn epoch(&self) -> usize {
        self.info.epoch
    }

    /// Condenses the report.
    pub fn summary(&self) -> TrainingSummary {
        TrainingSummary {
            epoch: self.info.epoch,
            train_loss: self.info.avg_loss(),
            train_accuracy: self.info.accuracy(),
            validation_loss: self.evaluation.loss,
            matrix: self.evaluation.matrix,
        }
    }
}

/// Epoch data plot error.
#[derive(Debug, Snafu)]
#[snafu(context(false))]
#[cfg(feature = "plotters")]
pub struct PlotError {
    source: DrawAreaError,
}

#[cfg(feature = "plotters")]
pub(crate) type DrawAreaError = plotters::prelude::DrawingAreaErrorKind<
    <plotters::prelude::BitMapBackend<'static> as plotters::prelude::DrawingBackend>::ErrorType,
>;

/// A padded axis range of the values, `None` when there is nothing to plot.
#[cfg(feature = "plotters")]
pub(crate) fn padded_range<I>(values: I) -> Option<std::ops::Range<f64>>
where
    I: IntoIterator<Item = f64>,
{
    use itertools::{Itertools, MinMaxResult};
    match values.into_iter().minmax() {
        MinMaxResult::NoElements => None,
        MinMaxResult::OneElement(v) => Some(0f64.min(v)..(v * 1.1).max(1.)),
        MinMaxResult::MinMax(min, max) => {
            let padding = (max - min) * 0.05;
            Some((min - padding)..(max + padding))
        }
    }
}

#[cfg(feature = "plotters")]
impl<Sample> EpochReport<Sample> {
    /// Plots loss and learning rate on the left, batch accuracy on the right.
    pub fn plot<P>(&self, output: P) -> Result<(), PlotError>
    where
        P: AsRef<Utf8Path>,
    {
        use plotters::prelude::*;

        let output = output.as_ref();
        let root = BitMapBackend::new(output, (2048, 768)).into_drawing_area();
        root.fill(&WHITE)?;
        let (left, right) = root.split_horizontally(1280);

        let (Some(x_range), Some(loss_range), Some(lr_range)) = (
            padded_range(self.info.loss.iter().map(|(x, _)| *x as f64)),
            padded_range(self.info.loss.iter().map(|(_, value)| f64::from(*value))),
            padded_range(self.info.learning_rate.iter().map(|(_, value)| *value)),
        ) else {
            tracing::warn!("Nothing to plot");
            return Ok(());
        };

        let mut chart = ChartBuilder::on(&left)
            .x_label_area_size(35)
            .y_label_area_size(50)
            .right_y_label_area_size(50)
            .margin(5)
            .caption("Learning rate and loss", ("sans-serif", 40.0).into_font())
            .build_cartesian_2d(x_range.clone(), loss_range)?
            .set_secondary_coord(x_range.clone(), lr_range);

        chart
            .configure_mesh()
            .disable_x_mesh()
            .disable_y_mesh()
            .y_desc("Loss")
            .y_label_formatter(&|x| format!("{:.2e}", x))
            .draw()?;

        chart
            .configure_secondary_axes()
            .y_desc("LR")
            .y_label_formatter(&|x| format!("{:.2e}", x))
            .draw()?;

        chart
            .draw_series(LineSeries::new(
                self.info.loss.iter().map(|(x, y)| (*x as f64, f64::from(*y))),
                &BLUE,
            ))?
            .label("loss")
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], BLUE));

        chart
            .draw_secondary_series(LineSeries::new(
                self.info.learning_rate.iter().map(|(x, y)| (*x as f64, *y)),
                &RED,
            ))?
            .label("lr")
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], RED));

        chart
            .configure_series_labels()
            .background_style(RGBColor(200, 200, 200))
            .draw()?;

        let mut accuracy = ChartBuilder::on(&right)
            .x_label_area_size(35)
            .y_label_area_size(50)
            .margin(5)
            .caption("Batch accuracy", ("sans-serif", 40.0).into_font())
            .build_cartesian_2d(x_range, 0f64..1.05f64)?;
        accuracy
            .configure_mesh()
            .disable_x_mesh()
            .y_desc("Accuracy")
            .draw()?;
        accuracy.draw_series(LineSeries::new(
            self.info.accuracy.iter().map(|(x, y)| (*x as f64, f64::from(*y))),
            &GREEN,
        ))?;

        root.present()?;

        Ok(())
    }
}

/// Save error.
#[derive(Debug, Snafu)]
pub enum SaveError {
    /// Unable to create a report file.
    #[snafu(display("Unable to create a report file at {path}"))]
    CreateFile {
        /// Path to the file.
        path: Utf8PathBuf,
        /// Source error.
        source: std::io::Error,
    },
    /// Unable to save a report file.
    #[snafu(display("Unable to save a report file at {path}"))]
    SaveFile {
        /// Path to the file.
        path: Utf8PathBuf,
        /// Source error.
        source: std::io::Error,
    },
}

impl<Sample> EpochReport<Sample>
where
    Sample: AsRef<str>,
{
    /// Saves the info to the file.
    pub fn save<P>(&self, path: P) -> Result<(), SaveError>
    where
        P: AsRef<Utf8Path>,
    {
        use std::io::Write as _;
        let path = path.as_ref();
        let mut f = std::io::BufWriter::new(
            std::fs::File::create(path).context(CreateFileSnafu { path })?,
        );
        writeln!(f, "{self}").context(SaveFileSnafu { path })
    }
}

impl<Sample> std::fmt::Display for EpochReport<Sample>
where
    Sample: AsRef<str>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Epoch #{}: samples count = {}, average loss = {:.4}, accuracy = {:.4}",
            self.info.epoch,
            self.info.samples_count,
            self.info.avg_loss(),
            self.info.accuracy(),
        )?;
        writeln!(
            f,
            "Validation: loss = {:.4}, accuracy = {:.4}",
            self.evaluation.loss,
            self.evaluation.matrix.accuracy(),
        )?;

        for beta in [0.5, 1.0, 2.0] {
            let (threshold, score) = self.evaluation.thresholds.best(beta);
            writeln!(
                f,
                "Best F_{beta} score: {:.2}% at t = {}",
                score * 100.,
                threshold as f64 / 100.
            )?;
        }
        writeln!(f, "{}", self.evaluation.thresholds)?;

        writeln!(f, "Samples (t = {}):", self.evaluation.matrix.threshold())?;
        for (sentence, predicted) in &self.samples {
            let is_spam = *predicted > self.evaluation.matrix.threshold();
            let color = if is_spam {
                AnsiColors::Red
            } else {
                AnsiColors::Green
            };
            writeln!(
                f,
                "spam: {}%. {}",
                format_args!("{: >6.2}", predicted * 100.).color(color),
                sentence.as_ref()
            )?;
        }
        Ok(())
    }
}

/// Final figures of a training run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingSummary {
    /// The last epoch number.
    pub epoch: usize,
    /// Average training loss of the last epoch.
    pub train_loss: f32,
    /// Training accuracy of the last epoch.
    pub train_accuracy: f64,
    /// Validation loss of the last epoch.
    pub validation_loss: f32,
    /// Validation predictions of the last epoch.
    pub matrix: ConfusionMatrix,
}

impl std::fmt::Display for TrainingSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "After {} epochs:", self.epoch)?;
        writeln!(
            f,
            "  train loss {:.4}, train accuracy {:.4}",
            self.train_loss, self.train_accuracy
        )?;
        writeln!(
            f,
            "  test loss {:.4}, test accuracy {:.4}\n",
            self.validation_loss,
            self.matrix.accuracy()
        )?;
        writeln!(f, "{}", self.matrix.report())?;
        write!(f, "{}", self.matrix)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn matrix() -> ConfusionMatrix {
        let mut matrix = ConfusionMatrix::default();
        // 3 spam: 2 caught, 1 missed; 5 ham: 4 correct, 1 false alarm.
        for (is_spam, p) in [
            (true, 0.9),
            (true, 0.7),
            (true, 0.4),
            (false, 0.1),
            (false, 0.2),
            (false, 0.5),
            (false, 0.05),
            (false, 0.8),
        ] {
            matrix.record(is_spam, p);
        }
        matrix
    }

    #[test]
    fn confusion_matrix() {
        let matrix = matrix();
        assert_eq!(matrix.true_positives, 2);
        assert_eq!(matrix.false_negatives, 1);
        // 0.5 is not above the threshold.
        assert_eq!(matrix.true_negatives, 4);
        assert_eq!(matrix.false_positives, 1);
        assert_eq!(matrix.total(), 8);
        assert!((matrix.accuracy() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn report() {
        let report = matrix().report();
        let [normal, spam] = report.classes;
        assert!((spam.precision - 2. / 3.).abs() < 1e-12);
        assert!((spam.recall - 2. / 3.).abs() < 1e-12);
        assert_eq!(spam.support, 3);
        assert!((normal.precision - 0.8).abs() < 1e-12);
        assert!((normal.recall - 0.8).abs() < 1e-12);
        assert_eq!(normal.support, 5);
        assert!((report.macro_avg.f1 - (0.8 + 2. / 3.) / 2.).abs() < 1e-12);
        assert!((report.weighted_avg.recall - 0.75).abs() < 1e-12);

        let text = report.to_string();
        assert!(text.contains("precision"));
        assert!(text.contains("Spam"));
        assert!(text.contains("weighted avg"));
    }

    #[test]
    fn empty_report_has_no_nans() {
        let report = ConfusionMatrix::default().report();
        assert_eq!(report.accuracy, 0.);
        assert!(report
            .classes
            .iter()
            .all(|c| c.precision == 0. && c.recall == 0. && c.f1 == 0.));
    }

    #[test]
    fn thresholds() {
        let mut info = ThresholdInfo::default();
        for p in [0.9, 0.8, 0.95] {
            info.record_prediction(true, p);
        }
        for p in [0.1, 0.2, 0.05, 0.3] {
            info.record_prediction(false, p);
        }
        // Out of range values are clamped.
        info.record_prediction(false, -1.);

        let (precision, recall) = info.precision_and_recall(0.5);
        assert!((precision - 1.).abs() < 1e-9);
        assert!((recall - 1.).abs() < 1e-9);
        let (_, best) = info.best(1.);
        assert!((best - 1.).abs() < 1e-9);
        assert!(info.to_string().contains("Precision"));
    }

    #[test]
    fn recorder() {
        let mut recorder = EpochReportRecorder::new(1, 6);
        recorder.record(4, 3, 1e-3, 0.6);
        recorder.record(2, 2, 1e-3, 0.4);
        assert!((recorder.avg_loss() - 0.5).abs() < 1e-6);
        assert!((recorder.accuracy() - 5. / 6.).abs() < 1e-12);

        let mut evaluation = Evaluation::new();
        evaluation.loss = 0.3;
        evaluation.record(true, 0.9);
        evaluation.record(false, 0.2);
        let report = recorder.finalize(evaluation, [("Tebrikler".to_owned(), 0.9)]);
        let summary = report.summary();
        assert_eq!(summary.epoch, 1);
        assert_eq!(summary.matrix.accuracy(), 1.);

        let text = report.to_string();
        assert!(text.contains("Epoch #1"));
        assert!(text.contains("Tebrikler"));
        assert!(summary.to_string().contains("Confusion matrix"));

        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("epoch.txt")).unwrap();
        report.save(&path).unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("Validation"));
    }
}
