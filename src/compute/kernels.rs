//! Precompiled kernel library.
//!
//! Each kernel has a fixed binding layout, a fixed push-constant block and a
//! workgroup size. The software device runs the `entry` function; the wgpu
//! backend compiles the WGSL source, which binds the storage buffers in
//! order and the push block as a uniform after them. WGSL has no 64-bit
//! floats, so kernels needing them carry no shader.

use std::collections::HashMap;

/// Entry point of a kernel, run once per dispatch over the whole grid
pub type KernelFn = fn(&mut KernelInvocation<'_>);

#[derive(Clone)]
pub struct KernelSpec {
    pub name: &'static str,
    /// Number of storage buffer bindings
    pub bindings: usize,
    /// Size of the push-constant block in bytes
    pub push_size: usize,
    pub local_size: [u32; 3],
    pub requires_int64: bool,
    pub requires_fp64: bool,
    pub entry: KernelFn,
    /// Shader for GPU backends, entry point `main`
    pub wgsl: Option<&'static str>,
}

impl std::fmt::Debug for KernelSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelSpec")
            .field("name", &self.name)
            .field("bindings", &self.bindings)
            .field("push_size", &self.push_size)
            .field("local_size", &self.local_size)
            .field("wgsl", &self.wgsl.is_some())
            .finish()
    }
}

/// Arguments visible to a running kernel
pub struct KernelInvocation<'a> {
    pub push: &'a [u8],
    pub buffers: &'a mut [Vec<u8>],
    pub global_size: [u32; 3],
}

impl KernelInvocation<'_> {
    pub fn push_u32(&self, offset: usize) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.push[offset..offset + 4]);
        u32::from_le_bytes(raw)
    }

    pub fn push_f32(&self, offset: usize) -> f32 {
        f32::from_bits(self.push_u32(offset))
    }

    pub fn push_f64(&self, offset: usize) -> f64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.push[offset..offset + 8]);
        f64::from_le_bytes(raw)
    }

    pub fn load_complex(&self, binding: usize, index: usize) -> (f32, f32) {
        (self.load_f32(binding, 2 * index), self.load_f32(binding, 2 * index + 1))
    }

    pub fn store_complex(&mut self, binding: usize, index: usize, (re, im): (f32, f32)) {
        self.store_f32(binding, 2 * index, re);
        self.store_f32(binding, 2 * index + 1, im);
    }

    pub fn load_f32(&self, binding: usize, index: usize) -> f32 {
        let base = index * 4;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.buffers[binding][base..base + 4]);
        f32::from_le_bytes(raw)
    }

    pub fn store_f32(&mut self, binding: usize, index: usize, value: f32) {
        let base = index * 4;
        self.buffers[binding][base..base + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Number of f32 elements the binding can hold
    pub fn len_f32(&self, binding: usize) -> usize {
        self.buffers[binding].len() / 4
    }

    pub fn invocations(&self) -> usize {
        self.global_size.iter().map(|&n| n as usize).product()
    }
}

/// Name → kernel lookup
#[derive(Debug, Clone, Default)]
pub struct KernelLibrary {
    kernels: HashMap<&'static str, KernelSpec>,
}

impl KernelLibrary {
    pub fn builtin() -> Self {
        let mut lib = Self::default();
        lib.register(KernelSpec {
            name: EMPHASIS,
            bindings: 2,
            push_size: EmphasisPush::SIZE,
            local_size: [64, 1, 1],
            requires_int64: false,
            requires_fp64: false,
            entry: emphasis_kernel,
            wgsl: Some(EMPHASIS_WGSL),
        });
        lib.register(KernelSpec {
            name: TONE,
            bindings: 1,
            push_size: TonePush::SIZE,
            local_size: [64, 1, 1],
            requires_int64: false,
            requires_fp64: true,
            entry: tone_kernel,
            wgsl: None,
        });
        lib.register(KernelSpec {
            name: TONE_F32,
            bindings: 1,
            push_size: ToneTurnsPush::SIZE,
            local_size: [64, 1, 1],
            requires_int64: false,
            requires_fp64: false,
            entry: tone_f32_kernel,
            wgsl: Some(TONE_F32_WGSL),
        });
        lib.register(KernelSpec {
            name: FFT_STAGE,
            bindings: 2,
            push_size: FftStagePush::SIZE,
            local_size: [64, 1, 1],
            requires_int64: false,
            requires_fp64: false,
            entry: fft_stage_kernel,
            wgsl: Some(FFT_STAGE_WGSL),
        });
        lib.register(KernelSpec {
            name: SPECTRUM_DB,
            bindings: 2,
            push_size: SpectrumPush::SIZE,
            local_size: [64, 1, 1],
            requires_int64: false,
            requires_fp64: false,
            entry: spectrum_db_kernel,
            wgsl: Some(SPECTRUM_DB_WGSL),
        });
        lib
    }

    pub fn register(&mut self, spec: KernelSpec) {
        self.kernels.insert(spec.name, spec);
    }

    pub fn get(&self, name: &str) -> Option<&KernelSpec> {
        self.kernels.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &&'static str> {
        self.kernels.keys()
    }
}

/// Push-constant block of a kernel
pub trait PushConstants {
    fn to_bytes(&self) -> Vec<u8>;
}

pub const EMPHASIS: &str = "emphasis";
pub const TONE: &str = "tone";
/// Single-precision tone for devices without 64-bit floats
pub const TONE_F32: &str = "tone-f32";
/// One radix-2 Stockham pass over interleaved complex f32
pub const FFT_STAGE: &str = "fft-stage";
/// Single-sided magnitude in dB of a complex spectrum
pub const SPECTRUM_DB: &str = "spectrum-db";

/// `out[i] = (in[i + tap] * c + in[i] * p) * scale` for `i < count`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmphasisPush {
    pub count: u32,
    pub samples_per_tap: u32,
    pub c: f32,
    pub p: f32,
    pub scale: f32,
}

impl EmphasisPush {
    pub const SIZE: usize = 20;
}

impl PushConstants for EmphasisPush {
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.count.to_le_bytes());
        out.extend_from_slice(&self.samples_per_tap.to_le_bytes());
        out.extend_from_slice(&self.c.to_le_bytes());
        out.extend_from_slice(&self.p.to_le_bytes());
        out.extend_from_slice(&self.scale.to_le_bytes());
        out
    }
}

fn emphasis_kernel(inv: &mut KernelInvocation<'_>) {
    let count = inv.push_u32(0) as usize;
    let tap = inv.push_u32(4) as usize;
    let c = inv.push_f32(8);
    let p = inv.push_f32(12);
    let scale = inv.push_f32(16);

    let n = count
        .min(inv.invocations())
        .min(inv.len_f32(1))
        .min(inv.len_f32(0).saturating_sub(tap));
    for i in 0..n {
        let v = (inv.load_f32(0, i + tap) * c + inv.load_f32(0, i) * p) * scale;
        inv.store_f32(1, i, v);
    }
}

/// `out[i] = bias + half_amplitude * sin(i * radians_per_sample + start_phase)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TonePush {
    pub radians_per_sample: f64,
    pub start_phase: f64,
    pub half_amplitude: f32,
    pub bias: f32,
    pub count: u32,
}

impl TonePush {
    pub const SIZE: usize = 32;
}

impl PushConstants for TonePush {
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.radians_per_sample.to_le_bytes());
        out.extend_from_slice(&self.start_phase.to_le_bytes());
        out.extend_from_slice(&self.half_amplitude.to_le_bytes());
        out.extend_from_slice(&self.bias.to_le_bytes());
        out.extend_from_slice(&self.count.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out
    }
}

const EMPHASIS_WGSL: &str = r#"
struct Params {
    count: u32,
    tap: u32,
    c: f32,
    p: f32,
    scale: f32,
}

@group(0) @binding(0) var<storage, read> src: array<f32>;
@group(0) @binding(1) var<storage, read_write> dst: array<f32>;
@group(0) @binding(2) var<uniform> params: Params;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let i = id.x;
    if (i >= params.count || i >= arrayLength(&dst) || i + params.tap >= arrayLength(&src)) {
        return;
    }
    dst[i] = (src[i + params.tap] * params.c + src[i] * params.p) * params.scale;
}
"#;

fn tone_kernel(inv: &mut KernelInvocation<'_>) {
    let rps = inv.push_f64(0);
    let phase = inv.push_f64(8);
    let half = inv.push_f32(16) as f64;
    let bias = inv.push_f32(20) as f64;
    let count = inv.push_u32(24) as usize;

    let n = count.min(inv.invocations()).min(inv.len_f32(0));
    for i in 0..n {
        let v = bias + half * (i as f64 * rps + phase).sin();
        inv.store_f32(0, i, v as f32);
    }
}

/// Samples per block of the turn accumulator in [`ToneTurnsPush`]
pub const TONE_BLOCK: u32 = 1024;

/// Tone phase in turns, split so single precision keeps long records accurate.
///
/// Sample `i` sits at `fract(i / B * block_turns) + (i % B) * turns_per_sample
/// + start_turns` turns, where `B` is [`TONE_BLOCK`] and `block_turns` is the
/// fractional phase advance of one block, computed on the host.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneTurnsPush {
    pub turns_per_sample: f32,
    pub block_turns: f32,
    pub start_turns: f32,
    pub half_amplitude: f32,
    pub bias: f32,
    pub count: u32,
}

impl ToneTurnsPush {
    pub const SIZE: usize = 24;

    /// Phase terms for `cycles_per_sample` and a start phase in radians
    pub fn new(cycles_per_sample: f64, start_phase: f64, half_amplitude: f32, bias: f32, count: u32) -> Self {
        let per_sample = cycles_per_sample.rem_euclid(1.0);
        Self {
            turns_per_sample: per_sample as f32,
            block_turns: (per_sample * TONE_BLOCK as f64).rem_euclid(1.0) as f32,
            start_turns: (start_phase / std::f64::consts::TAU).rem_euclid(1.0) as f32,
            half_amplitude,
            bias,
            count,
        }
    }
}

impl PushConstants for ToneTurnsPush {
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.turns_per_sample.to_le_bytes());
        out.extend_from_slice(&self.block_turns.to_le_bytes());
        out.extend_from_slice(&self.start_turns.to_le_bytes());
        out.extend_from_slice(&self.half_amplitude.to_le_bytes());
        out.extend_from_slice(&self.bias.to_le_bytes());
        out.extend_from_slice(&self.count.to_le_bytes());
        out
    }
}

fn tone_f32_kernel(inv: &mut KernelInvocation<'_>) {
    let per_sample = inv.push_f32(0);
    let per_block = inv.push_f32(4);
    let start = inv.push_f32(8);
    let half = inv.push_f32(12);
    let bias = inv.push_f32(16);
    let count = inv.push_u32(20) as usize;

    let n = count.min(inv.invocations()).min(inv.len_f32(0));
    for i in 0..n {
        let block = (i / TONE_BLOCK as usize) as f32;
        let within = (i % TONE_BLOCK as usize) as f32;
        let turns = (block * per_block).fract() + within * per_sample + start;
        let v = bias + half * (std::f32::consts::TAU * turns.fract()).sin();
        inv.store_f32(0, i, v);
    }
}

const TONE_F32_WGSL: &str = r#"
struct Params {
    turns_per_sample: f32,
    block_turns: f32,
    start_turns: f32,
    half_amplitude: f32,
    bias: f32,
    count: u32,
}

@group(0) @binding(0) var<storage, read_write> samples: array<f32>;
@group(0) @binding(1) var<uniform> params: Params;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let i = id.x;
    if (i >= params.count || i >= arrayLength(&samples)) {
        return;
    }
    let block_index = f32(i / 1024u);
    let within = f32(i % 1024u);
    let turns = fract(block_index * params.block_turns) + within * params.turns_per_sample + params.start_turns;
    samples[i] = params.bias + params.half_amplitude * sin(6.283185307179586 * fract(turns));
}
"#;

/// Pass of a length-`n` transform combining sub-transforms of length `span`.
///
/// Running the pass for `span = 1, 2, 4, .. n / 2`, alternating source and
/// destination, leaves the forward DFT in natural order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FftStagePush {
    pub n: u32,
    pub span: u32,
}

impl FftStagePush {
    pub const SIZE: usize = 8;
}

impl PushConstants for FftStagePush {
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.n.to_le_bytes());
        out.extend_from_slice(&self.span.to_le_bytes());
        out
    }
}

fn fft_stage_kernel(inv: &mut KernelInvocation<'_>) {
    let n = inv.push_u32(0) as usize;
    let span = inv.push_u32(4).max(1) as usize;
    let half = n / 2;
    if inv.len_f32(0) < 2 * n || inv.len_f32(1) < 2 * n {
        return;
    }

    for j in 0..half.min(inv.invocations()) {
        let k = j % span;
        let angle = -std::f64::consts::TAU * k as f64 / (2 * span) as f64;
        let (wr, wi) = (angle.cos() as f32, angle.sin() as f32);
        let (ar, ai) = inv.load_complex(0, j);
        let (xr, xi) = inv.load_complex(0, j + half);
        let (br, bi) = (xr * wr - xi * wi, xr * wi + xi * wr);
        let out = (j / span) * span * 2 + k;
        inv.store_complex(1, out, (ar + br, ai + bi));
        inv.store_complex(1, out + span, (ar - br, ai - bi));
    }
}

const FFT_STAGE_WGSL: &str = r#"
struct Params {
    n: u32,
    span: u32,
}

@group(0) @binding(0) var<storage, read> src: array<vec2<f32>>;
@group(0) @binding(1) var<storage, read_write> dst: array<vec2<f32>>;
@group(0) @binding(2) var<uniform> params: Params;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let half_n = params.n / 2u;
    let j = id.x;
    if (j >= half_n || params.n > arrayLength(&src) || params.n > arrayLength(&dst)) {
        return;
    }
    let span = max(params.span, 1u);
    let k = j % span;
    let angle = -6.283185307179586 * f32(k) / f32(2u * span);
    let w = vec2<f32>(cos(angle), sin(angle));
    let a = src[j];
    let x = src[j + half_n];
    let b = vec2<f32>(x.x * w.x - x.y * w.y, x.x * w.y + x.y * w.x);
    let dst_index = (j / span) * span * 2u + k;
    dst[dst_index] = a + b;
    dst[dst_index + span] = a - b;
}
"#;

/// `out[k] = 20 log10(s_k * |X_k| * inv_gain)` for `k < bins`, where `s_k` is 1
/// at DC and Nyquist and 2 elsewhere. Levels at or below -200 dB read `floor`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpectrumPush {
    pub bins: u32,
    pub n: u32,
    pub inv_gain: f32,
    pub floor: f32,
}

impl SpectrumPush {
    pub const SIZE: usize = 16;
}

impl PushConstants for SpectrumPush {
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.bins.to_le_bytes());
        out.extend_from_slice(&self.n.to_le_bytes());
        out.extend_from_slice(&self.inv_gain.to_le_bytes());
        out.extend_from_slice(&self.floor.to_le_bytes());
        out
    }
}

fn spectrum_db_kernel(inv: &mut KernelInvocation<'_>) {
    let bins = inv.push_u32(0) as usize;
    let n = inv.push_u32(4) as usize;
    let inv_gain = inv.push_f32(8);
    let floor = inv.push_f32(12);

    let count = bins
        .min(inv.invocations())
        .min(inv.len_f32(1))
        .min(inv.len_f32(0) / 2);
    for k in 0..count {
        let (re, im) = inv.load_complex(0, k);
        let scale = if k == 0 || (n % 2 == 0 && k == n / 2) { 1.0 } else { 2.0 };
        let mag = scale * re.hypot(im) * inv_gain;
        let db = if mag > 1e-10 { 20.0 * mag.log10() } else { floor };
        inv.store_f32(1, k, db);
    }
}

const SPECTRUM_DB_WGSL: &str = r#"
struct Params {
    bins: u32,
    n: u32,
    inv_gain: f32,
    floor: f32,
}

@group(0) @binding(0) var<storage, read> spectrum: array<vec2<f32>>;
@group(0) @binding(1) var<storage, read_write> level: array<f32>;
@group(0) @binding(2) var<uniform> params: Params;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let k = id.x;
    if (k >= params.bins || k >= arrayLength(&level) || k >= arrayLength(&spectrum)) {
        return;
    }
    var scale = 2.0;
    if (k == 0u || (params.n % 2u == 0u && k == params.n / 2u)) {
        scale = 1.0;
    }
    let mag = scale * length(spectrum[k]) * params.inv_gain;
    if (mag > 1e-10) {
        // 20 log10(x) = 20 log10(2) log2(x)
        level[k] = 6.020599913279624 * log2(mag);
    } else {
        level[k] = params.floor;
    }
}
"#;
