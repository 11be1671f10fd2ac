//! Bayesian optimization over a [`SearchSpace`] with a Gaussian-process
//! surrogate.
//!
//! Every tunable dimension is mapped onto the unit interval: uniform and
//! integer ranges linearly, log-uniform ranges in log space, and categorical
//! choices as equal-width buckets. The surrogate is an RBF-kernel GP fitted on
//! standardized objective values; the next point maximizes an acquisition
//! function over random candidates plus perturbations of the incumbent.

use bt_types::{Config, Metrics, Mode, ParameterValue, SearchError, TuneError, TuneResult};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::search::{
    check_property, ParameterDef, ParameterKind, SearchAlgorithm, SearchSpace, Suggestion,
};

/// Acquisition function scoring candidate points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Acquisition {
    /// Upper confidence bound: `mean + kappa * std`.
    Ucb { kappa: f64 },
    /// Expected improvement over the incumbent by at least `xi`.
    Ei { xi: f64 },
    /// Probability of improving on the incumbent by at least `xi`.
    Pi { xi: f64 },
}

impl Default for Acquisition {
    fn default() -> Self {
        Acquisition::Ucb { kappa: 2.576 }
    }
}

impl Acquisition {
    /// Compute acquisition value. All inputs are in maximization units.
    pub fn compute(&self, mean: f64, std: f64, best_so_far: f64) -> f64 {
        match *self {
            Acquisition::Ucb { kappa } => mean + kappa * std,
            Acquisition::Ei { xi } => {
                if std < 1e-10 {
                    return 0.0;
                }
                let improvement = mean - best_so_far - xi;
                let z = improvement / std;
                improvement * normal_cdf(z) + std * normal_pdf(z)
            }
            Acquisition::Pi { xi } => {
                if std < 1e-10 {
                    return if mean > best_so_far + xi { 1.0 } else { 0.0 };
                }
                normal_cdf((mean - best_so_far - xi) / std)
            }
        }
    }
}

fn normal_pdf(z: f64) -> f64 {
    (-0.5 * z * z).exp() / (2.0 * std::f64::consts::PI).sqrt()
}

fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
}

/// Abramowitz-Stegun approximation of the error function.
fn erf(x: f64) -> f64 {
    let a1 = 0.254829592;
    let a2 = -0.284496736;
    let a3 = 1.421413741;
    let a4 = -1.453152027;
    let a5 = 1.061405429;
    let p = 0.3275911;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();

    let t = 1.0 / (1.0 + p * x);
    let y = 1.0 - (((((a5 * t + a4) * t) + a3) * t + a2) * t + a1) * t * (-x * x).exp();

    sign * y
}

// ---------------------------------------------------------------------------
// Gaussian process surrogate
// ---------------------------------------------------------------------------

/// A GP fitted to a fixed set of observations.
#[derive(Debug, Clone)]
pub(crate) struct Surrogate {
    xs: Vec<Vec<f64>>,
    chol: Vec<f64>,
    alpha: Vec<f64>,
    y_mean: f64,
    y_scale: f64,
    length_scale: f64,
}

impl Surrogate {
    pub(crate) fn fit(
        xs: Vec<Vec<f64>>,
        ys: &[f64],
        length_scale: f64,
        noise: f64,
    ) -> Result<Self, SearchError> {
        let n = xs.len();
        if n == 0 || n != ys.len() {
            return Err(SearchError::Surrogate {
                message: format!("cannot fit {n} points against {} targets", ys.len()),
            });
        }

        let y_mean = ys.iter().sum::<f64>() / n as f64;
        let var = ys.iter().map(|y| (y - y_mean).powi(2)).sum::<f64>() / n as f64;
        let y_scale = if var.sqrt() > 1e-12 { var.sqrt() } else { 1.0 };
        let y: Vec<f64> = ys.iter().map(|v| (v - y_mean) / y_scale).collect();

        let mut surrogate = Self {
            xs,
            chol: Vec::new(),
            alpha: Vec::new(),
            y_mean,
            y_scale,
            length_scale,
        };

        let mut jitter = 1e-10;
        for _ in 0..6 {
            let mut k = vec![0.0; n * n];
            for i in 0..n {
                for j in 0..=i {
                    let v = surrogate.kernel(&surrogate.xs[i], &surrogate.xs[j]);
                    k[i * n + j] = v;
                    k[j * n + i] = v;
                }
                k[i * n + i] += noise + jitter;
            }
            if let Some(l) = cholesky(&k, n) {
                let z = solve_lower(&l, &y, n);
                surrogate.alpha = solve_upper(&l, &z, n);
                surrogate.chol = l;
                return Ok(surrogate);
            }
            jitter *= 100.0;
        }

        Err(SearchError::Surrogate {
            message: format!("kernel matrix over {n} points is not positive definite"),
        })
    }

    /// RBF (squared exponential) kernel with unit signal variance.
    fn kernel(&self, x1: &[f64], x2: &[f64]) -> f64 {
        let sq_dist: f64 = x1.iter().zip(x2).map(|(a, b)| (a - b).powi(2)).sum();
        (-sq_dist / (2.0 * self.length_scale.powi(2))).exp()
    }

    /// Posterior mean and standard deviation in standardized units.
    pub(crate) fn predict(&self, x: &[f64]) -> (f64, f64) {
        let n = self.xs.len();
        let k_star: Vec<f64> = self.xs.iter().map(|xi| self.kernel(x, xi)).collect();
        let mean: f64 = k_star.iter().zip(&self.alpha).map(|(k, a)| k * a).sum();
        let v = solve_lower(&self.chol, &k_star, n);
        let variance = (1.0 - v.iter().map(|vi| vi * vi).sum::<f64>()).max(1e-12);
        (mean, variance.sqrt())
    }

    /// Posterior mean and standard deviation in the units the model was fit on.
    #[cfg(test)]
    pub(crate) fn predict_raw(&self, x: &[f64]) -> (f64, f64) {
        let (mean, std) = self.predict(x);
        (mean * self.y_scale + self.y_mean, std * self.y_scale)
    }

    fn best_standardized(&self, ys: &[f64]) -> f64 {
        ys.iter()
            .map(|y| (y - self.y_mean) / self.y_scale)
            .fold(f64::NEG_INFINITY, f64::max)
    }
}

fn cholesky(a: &[f64], n: usize) -> Option<Vec<f64>> {
    let mut l = vec![0.0; n * n];
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[i * n + j];
            for k in 0..j {
                sum -= l[i * n + k] * l[j * n + k];
            }
            if i == j {
                if sum <= 0.0 || !sum.is_finite() {
                    return None;
                }
                l[i * n + i] = sum.sqrt();
            } else {
                l[i * n + j] = sum / l[j * n + j];
            }
        }
    }
    Some(l)
}

/// Solve `L x = b` for lower-triangular `L`.
fn solve_lower(l: &[f64], b: &[f64], n: usize) -> Vec<f64> {
    let mut x = vec![0.0; n];
    for i in 0..n {
        let mut sum = b[i];
        for k in 0..i {
            sum -= l[i * n + k] * x[k];
        }
        x[i] = sum / l[i * n + i];
    }
    x
}

/// Solve `L^T x = b` for lower-triangular `L`.
fn solve_upper(l: &[f64], b: &[f64], n: usize) -> Vec<f64> {
    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let mut sum = b[i];
        for k in (i + 1)..n {
            sum -= l[k * n + i] * x[k];
        }
        x[i] = sum / l[i * n + i];
    }
    x
}

// ---------------------------------------------------------------------------
// Unit-cube encoding
// ---------------------------------------------------------------------------

fn encode_value(kind: &ParameterKind, value: &ParameterValue) -> Option<f64> {
    let unit = |v: f64, low: f64, high: f64| {
        if high > low {
            ((v - low) / (high - low)).clamp(0.0, 1.0)
        } else {
            0.5
        }
    };
    match kind {
        ParameterKind::Constant { .. } => None,
        ParameterKind::FloatRange { low, high } => Some(unit(value.as_f64()?, *low, *high)),
        ParameterKind::IntRange { low, high } => {
            Some(unit(value.as_f64()?, *low as f64, *high as f64))
        }
        ParameterKind::LogUniform { low, high } => {
            Some(unit(value.as_f64()?.ln(), low.ln(), high.ln()))
        }
        ParameterKind::Choice { values } => {
            let json = value.to_json();
            let idx = values.iter().position(|v| *v == json)?;
            Some((idx as f64 + 0.5) / values.len() as f64)
        }
    }
}

fn decode_value(kind: &ParameterKind, u: f64) -> ParameterValue {
    let u = u.clamp(0.0, 1.0);
    match kind {
        ParameterKind::Constant { value } => value.clone(),
        ParameterKind::FloatRange { low, high } => ParameterValue::Float(low + u * (high - low)),
        ParameterKind::IntRange { low, high } => {
            let span = *high as f64 - *low as f64;
            let v = (*low as f64 + u * span).round() as i64;
            ParameterValue::Int(v.clamp(*low, *high))
        }
        ParameterKind::LogUniform { low, high } => {
            let log_v = low.ln() + u * (high.ln() - low.ln());
            ParameterValue::Float(log_v.exp().clamp(*low, *high))
        }
        ParameterKind::Choice { values } => {
            let idx = ((u * values.len() as f64) as usize).min(values.len() - 1);
            ParameterValue::from(values[idx].clone())
        }
    }
}

// ---------------------------------------------------------------------------
// Search algorithm
// ---------------------------------------------------------------------------

/// Tuning knobs for [`BayesOptSearch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BayesOptConfig {
    /// Random suggestions made before the surrogate takes over.
    pub random_search_steps: usize,
    pub acquisition: Acquisition,
    /// RBF length scale on the unit cube.
    pub length_scale: f64,
    /// Observation noise added to the kernel diagonal.
    pub noise: f64,
    /// Random candidates scored per suggestion.
    pub candidates: usize,
    /// Live-trial cap; zero means unlimited.
    pub max_concurrent: usize,
}

impl Default for BayesOptConfig {
    fn default() -> Self {
        Self {
            random_search_steps: 10,
            acquisition: Acquisition::default(),
            length_scale: 0.25,
            noise: 1e-6,
            candidates: 1000,
            max_concurrent: 0,
        }
    }
}

/// Gaussian-process Bayesian optimization with warm-start support.
///
/// Warm-start points that come with evaluated rewards are fed straight into
/// the surrogate. Points without rewards are suggested first, in order.
/// Trials still running are treated as observed at the worst value seen so
/// far so concurrent suggestions spread out.
#[derive(Debug, Clone)]
pub struct BayesOptSearch {
    metric: Option<String>,
    mode: Option<Mode>,
    space: Option<SearchSpace>,
    config: BayesOptConfig,
    points_to_evaluate: Vec<Config>,
    evaluated_rewards: Option<Vec<f64>>,
    queued: VecDeque<Config>,
    /// Encoded points and objective values, in maximization units.
    observations: Vec<(Vec<f64>, f64)>,
    live: HashMap<Uuid, Vec<f64>>,
    rng: ChaCha8Rng,
    prepared: bool,
}

impl BayesOptSearch {
    pub fn new() -> Self {
        Self {
            metric: None,
            mode: None,
            space: None,
            config: BayesOptConfig::default(),
            points_to_evaluate: Vec::new(),
            evaluated_rewards: None,
            queued: VecDeque::new(),
            observations: Vec::new(),
            live: HashMap::new(),
            rng: ChaCha8Rng::from_entropy(),
            prepared: false,
        }
    }

    pub fn with_metric(mut self, metric: impl Into<String>, mode: Mode) -> Self {
        self.metric = Some(metric.into());
        self.mode = Some(mode);
        self
    }

    pub fn with_space(mut self, space: SearchSpace) -> Self {
        self.space = Some(space);
        self
    }

    pub fn with_points_to_evaluate(mut self, points: Vec<Config>) -> Self {
        self.points_to_evaluate = points;
        self
    }

    /// Known metric values for `points_to_evaluate`, matched by position.
    pub fn with_evaluated_rewards(mut self, rewards: Vec<f64>) -> Self {
        self.evaluated_rewards = Some(rewards);
        self
    }

    pub fn with_random_seed(mut self, seed: u64) -> Self {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.config.max_concurrent = max_concurrent;
        self
    }

    pub fn with_config(mut self, config: BayesOptConfig) -> Self {
        let max_concurrent = self.config.max_concurrent;
        self.config = config;
        if self.config.max_concurrent == 0 {
            self.config.max_concurrent = max_concurrent;
        }
        self
    }

    pub fn config(&self) -> &BayesOptConfig {
        &self.config
    }

    /// Number of (point, value) pairs the surrogate is fit on.
    pub fn observation_count(&self) -> usize {
        self.observations.len()
    }

    /// Register warm-start points once metric, mode, and space are all known.
    fn prepare(&mut self) -> TuneResult<()> {
        if self.prepared {
            return Ok(());
        }
        let space = self.space.as_ref().ok_or_else(|| SearchError::MissingSpace {
            algorithm: self.name().to_string(),
        })?;
        let mode = self.mode.ok_or_else(|| {
            bt_types::config_error!("bayesopt needs a mode before it can suggest")
        })?;
        space.validate()?;

        for point in &self.points_to_evaluate {
            space.contains(point)?;
        }

        match &self.evaluated_rewards {
            Some(rewards) => {
                if rewards.len() != self.points_to_evaluate.len() {
                    return Err(SearchError::RewardCountMismatch {
                        points: self.points_to_evaluate.len(),
                        rewards: rewards.len(),
                    }
                    .into());
                }
                let mut warm = Vec::with_capacity(rewards.len());
                for (index, (point, reward)) in
                    self.points_to_evaluate.iter().zip(rewards).enumerate()
                {
                    if !reward.is_finite() {
                        return Err(SearchError::InvalidReward {
                            index,
                            value: *reward,
                        }
                        .into());
                    }
                    warm.push((encode(space, point)?, mode.sign() * reward));
                }
                self.observations.extend(warm);
                info!(
                    points = self.observations.len(),
                    "registered warm-start observations"
                );
            }
            None => {
                self.queued = self
                    .points_to_evaluate
                    .iter()
                    .map(|p| space.complete(p.clone()))
                    .collect();
                if !self.queued.is_empty() {
                    info!(points = self.queued.len(), "queued warm-start points");
                }
            }
        }

        self.prepared = true;
        Ok(())
    }

    fn random_point(&mut self, dims: usize) -> Vec<f64> {
        (0..dims).map(|_| self.rng.gen::<f64>()).collect()
    }

    /// Pick the next encoded point by maximizing the acquisition function.
    fn propose(&mut self, dims: usize) -> TuneResult<Vec<f64>> {
        let mut xs: Vec<Vec<f64>> = self.observations.iter().map(|(x, _)| x.clone()).collect();
        let mut ys: Vec<f64> = self.observations.iter().map(|(_, y)| *y).collect();
        let best_observed = ys.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let worst_observed = ys.iter().cloned().fold(f64::INFINITY, f64::min);

        // Running trials count as poor outcomes at their location.
        let mut live: Vec<(&Uuid, &Vec<f64>)> = self.live.iter().collect();
        live.sort_by(|a, b| a.0.cmp(b.0));
        for (_, x) in live {
            xs.push(x.clone());
            ys.push(worst_observed);
        }

        let incumbent = self
            .observations
            .iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(x, _)| x.clone());

        let gp = Surrogate::fit(xs, &ys, self.config.length_scale, self.config.noise)?;
        let best = gp.best_standardized(&[best_observed]);

        let mut best_x = self.random_point(dims);
        let mut best_acq = f64::NEG_INFINITY;
        let exploit = self.config.candidates / 5;

        for i in 0..self.config.candidates.max(1) {
            let x = match (&incumbent, i < exploit) {
                (Some(base), true) => base
                    .iter()
                    .map(|v| (v + self.rng.gen_range(-0.1..0.1)).clamp(0.0, 1.0))
                    .collect(),
                _ => self.random_point(dims),
            };
            let (mean, std) = gp.predict(&x);
            let acq = self.config.acquisition.compute(mean, std, best);
            if acq > best_acq {
                best_acq = acq;
                best_x = x;
            }
        }

        debug!(acquisition = best_acq, "proposed point from surrogate");
        Ok(best_x)
    }
}

impl Default for BayesOptSearch {
    fn default() -> Self {
        Self::new()
    }
}

fn encode(space: &SearchSpace, config: &Config) -> TuneResult<Vec<f64>> {
    space
        .tunable()
        .map(|param| {
            config
                .get(&param.name)
                .and_then(|v| encode_value(&param.kind, v))
                .ok_or_else(|| {
                    TuneError::from(SearchError::OutOfDomain {
                        parameter: param.name.clone(),
                        value: config
                            .get(&param.name)
                            .map(|v| v.to_string())
                            .unwrap_or_else(|| "<missing>".to_string()),
                    })
                })
        })
        .collect()
}

fn decode(space: &SearchSpace, point: &[f64]) -> Config {
    let tunable: Vec<&ParameterDef> = space.tunable().collect();
    let config: Config = tunable
        .iter()
        .zip(point)
        .map(|(param, u)| (param.name.clone(), decode_value(&param.kind, *u)))
        .collect();
    space.complete(config)
}

impl SearchAlgorithm for BayesOptSearch {
    fn set_search_properties(
        &mut self,
        metric: &str,
        mode: Mode,
        space: &SearchSpace,
    ) -> TuneResult<()> {
        check_property(self.name(), self.metric.as_ref(), &metric.to_string())?;
        check_property(self.name(), self.mode.as_ref(), &mode)?;
        self.metric.get_or_insert_with(|| metric.to_string());
        self.mode.get_or_insert(mode);
        if self.space.is_none() {
            self.space = Some(space.clone());
        }
        self.prepare()
    }

    fn suggest(&mut self, trial_id: Uuid) -> TuneResult<Suggestion> {
        self.prepare()?;

        let limit = self.config.max_concurrent;
        if limit > 0 && self.live.len() >= limit {
            return Ok(Suggestion::Wait);
        }

        let space = match &self.space {
            Some(space) => space.clone(),
            None => {
                return Err(SearchError::MissingSpace {
                    algorithm: self.name().to_string(),
                }
                .into())
            }
        };
        let dims = space.tunable().count();

        let config = if let Some(point) = self.queued.pop_front() {
            point
        } else if self.observations.len() + self.live.len() < self.config.random_search_steps
            || self.observations.is_empty()
            || dims == 0
        {
            let point = self.random_point(dims);
            decode(&space, &point)
        } else {
            let point = self.propose(dims)?;
            decode(&space, &point)
        };

        self.live.insert(trial_id, encode(&space, &config)?);
        Ok(Suggestion::Config(config))
    }

    fn on_trial_complete(&mut self, trial_id: Uuid, metrics: Option<&Metrics>, errored: bool) {
        let Some(point) = self.live.remove(&trial_id) else {
            return;
        };
        if errored {
            return;
        }
        let (Some(metric), Some(mode)) = (self.metric.as_deref(), self.mode) else {
            return;
        };
        match metrics.and_then(|m| m.get(metric)).copied() {
            Some(value) if value.is_finite() => {
                self.observations.push((point, mode.sign() * value));
            }
            _ => warn!(
                trial = %trial_id,
                metric,
                "trial finished without a finite value for the metric"
            ),
        }
    }

    fn max_concurrent(&self) -> Option<usize> {
        (self.config.max_concurrent > 0).then_some(self.config.max_concurrent)
    }

    fn name(&self) -> &str {
        "bayesopt"
    }
}
