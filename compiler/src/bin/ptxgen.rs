// PTX generator CLI: assembles the built-in demonstration module.
use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::path::PathBuf;

use ptxgen::{
    addr, vec_operand, ArraySpec, AsmError, Atom, BuildOptions, CachedModule, Deferred,
    EmitContext, Entry, EntryHandle, Fragment, FragmentHandle, FragmentKind, Guard,
    ModuleBuilder, Value,
};

/// Multiply-with-carry RNG state, shared by every kernel that consumes
/// random numbers. Module setup reserves the seed array; entry setup pulls
/// the per-thread state into registers that stay visible to every fragment
/// in the entry; teardown writes the state back.
#[derive(Default)]
struct MwcRng;

impl MwcRng {
    const MULT: i64 = 0xfffe_b81b;

    fn handle() -> FragmentHandle {
        FragmentHandle::new("mwc_rng", || Box::new(MwcRng))
    }
}

impl Fragment for MwcRng {
    fn kind(&self) -> FragmentKind {
        FragmentKind::new("mwc_rng")
    }

    fn namespace(&self) -> Vec<(String, Value)> {
        vec![("MWC_MULT".to_string(), Value::Num(Self::MULT))]
    }

    fn module_setup(&mut self, cx: &mut EmitContext<'_>) -> Result<(), AsmError> {
        cx.mem("global", "u32", "mwc_seeds", ArraySpec::Unbounded, None)?;
        Ok(())
    }

    fn entry_setup(&mut self, cx: &mut EmitContext<'_>) -> Result<(), AsmError> {
        cx.reg("u32", "mwc_st mwc_carry mwc_addr")?;
        let st = cx.get("mwc_st")?;
        let carry = cx.get("mwc_carry")?;
        let address = cx.get("mwc_addr")?;
        let seeds = cx.get("mwc_seeds")?;
        cx.op("mov.u32", &[Atom::from(&address), Atom::from(&seeds)])?;
        cx.op(
            "ld.global.v2.u32",
            &[
                vec_operand(&[Atom::from(&st), Atom::from(&carry)]),
                addr(&address, None),
            ],
        )?;
        Ok(())
    }

    fn entry_teardown(&mut self, cx: &mut EmitContext<'_>) -> Result<(), AsmError> {
        let st = cx.get("mwc_st")?;
        let carry = cx.get("mwc_carry")?;
        let address = cx.get("mwc_addr")?;
        cx.op(
            "st.global.v2.u32",
            &[
                addr(&address, None),
                vec_operand(&[Atom::from(&st), Atom::from(&carry)]),
            ],
        )?;
        Ok(())
    }

    fn tests(&self) -> Vec<EntryHandle> {
        vec![EntryHandle::new("mwc_rng_sum_test", || {
            Box::new(MwcRngSumTest)
        })]
    }
}

/// Self-test: run the generator for a fixed round count and write the
/// running sum back for the host to check against a reference.
struct MwcRngSumTest;

impl Fragment for MwcRngSumTest {
    fn kind(&self) -> FragmentKind {
        FragmentKind::new("mwc_rng_sum_test")
    }

    fn deps(&self) -> Vec<FragmentHandle> {
        vec![MwcRng::handle()]
    }
}

impl Entry for MwcRngSumTest {
    fn name(&self) -> &str {
        "MWC RNG sum check"
    }

    fn entry_name(&self) -> &str {
        "mwc_rng_sum_test"
    }

    fn body(&mut self, cx: &mut EmitContext<'_>) -> Result<(), AsmError> {
        cx.block(Some("accumulate rng output"), |cx| {
            cx.reg("u32", "sum rounds")?;
            cx.reg("pred", "p_more")?;
            let sum = cx.get("sum")?;
            let rounds = cx.get("rounds")?;
            let p_more = cx.get("p_more")?;
            let st = cx.get("mwc_st")?;
            let carry = cx.get("mwc_carry")?;
            let mult = cx.get("MWC_MULT")?;
            cx.op("mov.u32", &[Atom::from(&sum), Atom::from(0i64)])?;
            cx.op("mov.u32", &[Atom::from(&rounds), Atom::from(1000i64)])?;
            cx.label("sum_loop")?;
            cx.op(
                "mad.lo.u32",
                &[
                    Atom::from(&st),
                    Atom::from(&st),
                    Atom::from(&mult),
                    Atom::from(&carry),
                ],
            )?;
            cx.op("add.u32", &[Atom::from(&sum), Atom::from(&sum), Atom::from(&st)])?;
            cx.op(
                "sub.u32",
                &[Atom::from(&rounds), Atom::from(&rounds), Atom::from(1i64)],
            )?;
            cx.op(
                "setp.gt.u32",
                &[Atom::from(&p_more), Atom::from(&rounds), Atom::from(0i64)],
            )?;
            cx.op_guarded("bra.uni", &[Atom::lit("sum_loop")], Guard::ifp(p_more.clone()))?;
            let address = cx.get("mwc_addr")?;
            cx.op("st.global.u32", &[addr(&address, None), Atom::from(&sum)])?;
            Ok(())
        })
    }
}

/// Tunes the sample-stream length from what the pass actually used. The
/// length lands in a deferred slot read by entry bodies; when the measured
/// value moves, the pass is flagged stale and the module reassembles with
/// the settled figure.
struct StreamTuner {
    stream_len: Deferred,
    uses: usize,
    settled: Option<usize>,
}

impl Default for StreamTuner {
    fn default() -> Self {
        Self {
            stream_len: Deferred::new("stream_len"),
            uses: 0,
            settled: None,
        }
    }
}

impl StreamTuner {
    const SAMPLES_PER_USE: usize = 16;

    fn handle() -> FragmentHandle {
        FragmentHandle::new("stream_tuner", || Box::new(StreamTuner::default()))
    }
}

impl Fragment for StreamTuner {
    fn kind(&self) -> FragmentKind {
        FragmentKind::new("stream_tuner")
    }

    fn namespace(&self) -> Vec<(String, Value)> {
        vec![(
            "stream_len".to_string(),
            Value::Deferred(self.stream_len.clone()),
        )]
    }

    fn module_setup(&mut self, _cx: &mut EmitContext<'_>) -> Result<(), AsmError> {
        self.uses = 0;
        Ok(())
    }

    fn entry_setup(&mut self, _cx: &mut EmitContext<'_>) -> Result<(), AsmError> {
        self.uses += 1;
        Ok(())
    }

    fn finalize_code(&mut self, cx: &mut EmitContext<'_>) -> Result<(), AsmError> {
        let measured = self.uses * Self::SAMPLES_PER_USE;
        self.stream_len.set(measured);
        if self.settled != Some(measured) {
            self.settled = Some(measured);
            cx.flag_stale();
        }
        Ok(())
    }
}

/// The demo kernel: fill a buffer with raw RNG output.
struct RandFill;

impl Fragment for RandFill {
    fn kind(&self) -> FragmentKind {
        FragmentKind::new("rand_fill")
    }

    fn deps(&self) -> Vec<FragmentHandle> {
        vec![MwcRng::handle(), StreamTuner::handle()]
    }
}

impl Entry for RandFill {
    fn name(&self) -> &str {
        "random fill"
    }

    fn entry_name(&self) -> &str {
        "rand_fill"
    }

    fn params(&self) -> Vec<(String, String)> {
        vec![("u32".to_string(), "out_ptr".to_string())]
    }

    fn body(&mut self, cx: &mut EmitContext<'_>) -> Result<(), AsmError> {
        cx.block(Some("fill the sample stream with rng output"), |cx| {
            cx.reg("u32", "idx out_reg")?;
            cx.reg("pred", "p_more")?;
            let idx = cx.get("idx")?;
            let out_reg = cx.get("out_reg")?;
            let p_more = cx.get("p_more")?;
            let out_ptr = cx.get("out_ptr")?;
            let st = cx.get("mwc_st")?;
            let carry = cx.get("mwc_carry")?;
            let mult = cx.get("MWC_MULT")?;
            let stream_len = cx.get("stream_len")?;
            cx.op("ld.param.u32", &[Atom::from(&out_reg), addr(&out_ptr, None)])?;
            cx.op("mov.u32", &[Atom::from(&idx), Atom::from(0i64)])?;
            cx.label("fill_loop")?;
            cx.op(
                "mad.lo.u32",
                &[
                    Atom::from(&st),
                    Atom::from(&st),
                    Atom::from(&mult),
                    Atom::from(&carry),
                ],
            )?;
            cx.op(
                "st.global.u32",
                &[
                    addr(&out_reg, Some(Atom::from(&idx))),
                    Atom::from(&st),
                ],
            )?;
            cx.op("add.u32", &[Atom::from(&idx), Atom::from(&idx), Atom::from(4i64)])?;
            cx.op(
                "setp.lt.u32",
                &[
                    Atom::from(&p_more),
                    Atom::from(&idx),
                    Atom::from(&stream_len),
                ],
            )?;
            cx.op_guarded("bra.uni", &[Atom::lit("fill_loop")], Guard::ifp(p_more.clone()))?;
            Ok(())
        })
    }
}

#[derive(Parser)]
#[command(name = "ptxgen")]
#[command(version = "0.1.0")]
#[command(about = "Assemble the built-in demo PTX module", long_about = None)]
struct Cli {
    /// Write the PTX source here instead of stdout
    #[arg(short, long, value_name = "OUTPUT")]
    output: Option<PathBuf>,

    /// Build fragment self-tests into the module
    #[arg(long)]
    tests: bool,

    /// Also write a JSON manifest of the build result
    #[arg(long, value_name = "MANIFEST")]
    manifest: Option<PathBuf>,

    /// Target architecture directive
    #[arg(long, default_value = "sm_20")]
    target: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let options = BuildOptions {
        target: cli.target.clone(),
        build_tests: cli.tests,
        ..BuildOptions::default()
    };
    let module = ModuleBuilder::new()
        .entry(EntryHandle::new("rand_fill", || Box::new(RandFill)))
        .options(options)
        .build()
        .context("Module assembly failed")?;

    eprintln!(
        "Assembled {} fragment(s), {} entry(ies) in {} pass(es)",
        module.fragments.len(),
        module.entries.len(),
        module.compiles
    );

    match &cli.output {
        Some(path) => fs::write(path, &module.source)
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => println!("{}", module.source),
    }

    if let Some(path) = &cli.manifest {
        let record = CachedModule::from_module(&module);
        let json = serde_json::to_string_pretty(&record)?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }

    Ok(())
}
