//! Backend integration tests: whole programs in, assembly text out.

use rstest::rstest;

use crate::back::codegen::{imm_fits, split_offset};
use crate::compile;

fn assemble(src: &str) -> String {
    compile(src).expect("program should compile")
}

/// The text of one function, from its label up to its `.size` directive.
fn function_text<'a>(asm: &'a str, name: &str) -> &'a str {
    let label = format!("\n{name}:\n");
    let start = asm.find(&label).expect("function label should be emitted") + 1;
    let end = start
        + asm[start..]
            .find("\t.size")
            .expect(".size should close the function");
    &asm[start..end]
}

/// The immediate of the prologue's `addi sp, sp, -N`.
fn frame_size(func: &str) -> i32 {
    let line = func
        .lines()
        .find(|l| l.starts_with("\taddi\tsp, sp, -"))
        .expect("prologue should adjust sp");
    -line.rsplit(' ').next().unwrap().parse::<i32>().unwrap()
}

#[rstest]
#[case(4000)]
#[case(-3000)]
#[case(2048)]
#[case(-2049)]
#[case(100000)]
#[case(-100000)]
#[case(4095)]
#[case(4096)]
#[case(i32::MIN / 2)]
fn split_offset_reassembles(#[case] offset: i32) {
    assert!(!imm_fits(offset));
    let (hi20, lo12) = split_offset(offset);
    assert!((-2048..=2047).contains(&lo12), "lo12 {lo12} out of range");
    let rebuilt = (((hi20 as u32) << 12) as i32).wrapping_add(lo12);
    assert_eq!(rebuilt, offset);
}

#[test]
fn imm_range_bounds() {
    assert!(imm_fits(-2048));
    assert!(imm_fits(2047));
    assert!(!imm_fits(-2049));
    assert!(!imm_fits(2048));
}

#[test]
fn trivial_main_has_minimal_frame() {
    let asm = assemble("int main() { return 0; }");
    let main = function_text(&asm, "main");
    assert!(asm.contains("\t.globl\tmain"));
    assert_eq!(frame_size(main), 16);
    assert!(main.contains("\tli\tt0, 0"));
    assert!(main.contains("\tmv\ta0, t0"));
    // no call, so no ra save
    assert!(!main.contains("\tsd\tra,"));
    assert!(main.contains("\tsd\ts0, 8(sp)"));
    assert!(main.contains("\tld\ts0, 8(sp)"));
    assert!(main.contains(".main_ret:"));
    assert!(main.ends_with("\tret\n"));
}

#[test]
fn calls_save_and_restore_ra() {
    let asm = assemble("int main() { putint(42); return 0; }");
    let main = function_text(&asm, "main");
    assert!(main.contains("\tli\tt0, 42"));
    assert!(main.contains("\tmv\ta0, t0"));
    assert!(main.contains("\tcall\tputint"));
    assert!(main.contains("\tsd\tra, 8(sp)"));
    assert!(main.contains("\tld\tra, 8(sp)"));
    let save = main.find("\tsd\tra").unwrap();
    let call = main.find("\tcall").unwrap();
    let restore = main.find("\tld\tra").unwrap();
    assert!(save < call && call < restore);
}

#[test]
fn surplus_parameters_stay_on_the_caller_stack() {
    let src = "
        int sum(int a, int b, int c, int d, int e, int f, int g, int h,
                int i, int j) {
            return i + j;
        }
        int main() {
            return sum(1, 2, 3, 4, 5, 6, 7, 8, 9, 10);
        }
    ";
    let asm = assemble(src);
    let sum = function_text(&asm, "sum");
    // exactly the eight register parameters get an initial store
    let stores = sum.lines().filter(|l| l.starts_with("\tsw\t")).count();
    assert_eq!(stores, 8);
    for arg in ["a0", "a1", "a2", "a3", "a4", "a5", "a6", "a7"] {
        assert!(sum.contains(&format!("\tsw\t{arg}, ")), "no store of {arg}");
    }
    // the ninth and tenth are read from the caller's frame
    assert!(sum.contains(", 0(s0)"));
    assert!(sum.contains(", 8(s0)"));

    // and the caller staged them at sp+0 / sp+8
    let main = function_text(&asm, "main");
    assert!(main.contains("\tsw\tt0, 0(sp)") || main.contains(", 0(sp)"));
    assert!(main.contains(", 8(sp)"));
}

#[test]
fn large_array_frame_is_aligned_and_indexed_with_slli() {
    let src = "
        int main() {
            int a[1024];
            int i = getint();
            a[i] = 3;
            return a[10];
        }
    ";
    let asm = assemble(src);
    let main = function_text(&asm, "main");
    // non-constant index scales by shifting
    assert!(main.contains("\tslli\t"));
    assert!(main.lines().any(|l| l.starts_with("\tslli\t") && l.ends_with(", 2")));
    // the frame no longer fits a 12-bit immediate, so the prologue bumps
    // by 2032 and materializes the rest through t0
    assert!(main.contains("\taddi\tsp, sp, -2032"));
    assert!(main.contains("\taddi\ts0, sp, 2032"));
    assert!(main.contains("\tli\tt0, "));
    assert!(main.contains("\tadd\tsp, sp, t0"));
    assert!(main.contains("\tsd\tra, 2024(sp)"));
    assert!(main.contains("\tsd\ts0, 2016(sp)"));
    // out-of-range local offsets go through lui
    assert!(main.contains("\tlui\t"));
}

#[test]
fn frame_sizes_are_multiples_of_sixteen() {
    let programs = [
        "int main() { return 0; }",
        "int main() { int a; int b; int c; a = 1; b = 2; c = 3; return a + b + c; }",
        "int main() { int a[7]; a[0] = 1; return a[0]; }",
        "int main() { int a[1000]; a[999] = 1; return a[999]; }",
        "int f(int x) { return x; } int main() { return f(5); }",
    ];
    for src in programs {
        let asm = assemble(src);
        let main = function_text(&asm, "main");
        let size = frame_size(main);
        // the large-frame prologue first bumps by 2032, which is not a
        // multiple of 16 on its own
        if size != 2032 {
            assert_eq!(size % 16, 0, "frame {size} not aligned in: {src}");
        }
    }
}

#[test]
fn float_compare_branches_through_a_bridge_block() {
    let src = "
        int main() {
            float f = getfloat();
            if (f < 1.0) {
                putint(1);
            }
            return 0;
        }
    ";
    let asm = assemble(src);
    let main = function_text(&asm, "main");
    assert!(main.contains("\tflt.s\t"));
    // the flag is compared against the zero register
    assert!(main.lines().any(|l| l.starts_with("\tbne\t") && l.contains(", zero, ")));
    // 1.0f is interned in the literal pool
    assert!(asm.contains("\t.section\t.sdata,\"aw\",@progbits"));
    assert!(asm.contains(".LC0:"));
    assert!(asm.contains(&format!("\t.word\t{}", 1.0f32.to_bits() as i32)));
}

#[test]
fn every_branch_is_followed_by_a_plain_jump() {
    let src = "
        int main() {
            int i = 0;
            int n = getint();
            while (i < n) {
                if (i % 2 == 0) {
                    putint(i);
                } else {
                    putch(32);
                }
                i = i + 1;
            }
            return 0;
        }
    ";
    let asm = assemble(src);
    let main = function_text(&asm, "main");
    let lines: Vec<&str> = main.lines().collect();
    let mut branches = 0;
    for (i, line) in lines.iter().enumerate() {
        if line.starts_with("\tbeq\t")
            || line.starts_with("\tbne\t")
            || line.starts_with("\tblt\t")
            || line.starts_with("\tbge\t")
        {
            branches += 1;
            assert!(
                lines[i + 1].starts_with("\tj\t"),
                "branch not followed by a jump: {line}"
            );
        }
    }
    assert!(branches > 0);
}

#[test]
fn branch_targets_are_labels_of_the_same_function() {
    let src = "
        int main() {
            int i = 0;
            while (i < 10) {
                i = i + 1;
                if (i == 5) {
                    break;
                }
            }
            return i;
        }
    ";
    let asm = assemble(src);
    let main = function_text(&asm, "main");
    let labels: Vec<&str> = main
        .lines()
        .filter(|l| l.ends_with(':') && !l.starts_with('\t'))
        .map(|l| l.trim_end_matches(':'))
        .collect();
    for line in main.lines() {
        let target = if line.starts_with("\tj\t") {
            line.rsplit('\t').next().unwrap()
        } else if line.starts_with("\tbeq\t")
            || line.starts_with("\tbne\t")
            || line.starts_with("\tblt\t")
            || line.starts_with("\tbge\t")
        {
            line.rsplit(' ').next().unwrap()
        } else {
            continue;
        };
        assert!(
            labels.contains(&target),
            "target {target} is not defined in main: {labels:?}"
        );
    }
}

#[test]
fn out_of_range_store_goes_through_lui() {
    let src = "
        int main() {
            int a[2560];
            a[2500] = 1;
            return 0;
        }
    ";
    let asm = assemble(src);
    let main = function_text(&asm, "main");
    assert!(main.contains("\tlui\t"));
    // every remaining load/store offset is encodable
    for line in main.lines() {
        if let Some(open) = line.find('(') {
            let mnemonic_and_offset = &line[..open];
            let offset: i32 = mnemonic_and_offset
                .rsplit(|c| c == ' ' || c == '\t')
                .next()
                .unwrap()
                .parse()
                .unwrap();
            assert!(imm_fits(offset), "offset out of range in: {line}");
        }
    }
}

#[test]
fn recompiling_yields_identical_text() {
    let src = "
        int fib(int n) {
            if (n < 2) {
                return n;
            }
            return fib(n - 1) + fib(n - 2);
        }
        int main() {
            putint(fib(10));
            return 0;
        }
    ";
    assert_eq!(assemble(src), assemble(src));
}

#[test]
fn float_literals_are_interned_by_bit_pattern() {
    let src = "
        int main() {
            float a = 1.5;
            float b = 1.5;
            float c = 2.5;
            putfloat(a + b + c);
            return 0;
        }
    ";
    let asm = assemble(src);
    assert!(asm.contains(".LC0:"));
    assert!(asm.contains(".LC1:"));
    assert!(!asm.contains(".LC2:"));
}

#[test]
fn value_live_across_a_call_gets_a_callee_saved_register() {
    let src = "
        int g() { return 1; }
        int main() { return g() + g(); }
    ";
    let asm = assemble(src);
    let main = function_text(&asm, "main");
    // the first result survives the second call in s1, which the
    // prologue must then save
    assert!(main.contains("\tsd\ts1, "));
    assert!(main.contains("\tld\ts1, "));
    assert_eq!(frame_size(main), 32);
    // but g itself touches no callee-saved register and makes no call
    let g = function_text(&asm, "g");
    assert!(!g.contains("\tsd\ts1,"));
    assert!(!g.contains("\tsd\tra,"));
}

#[test]
fn prologue_never_saves_caller_saved_registers() {
    let src = "
        int main() {
            int x = getint();
            int y = getint();
            return x * y;
        }
    ";
    let asm = assemble(src);
    let main = function_text(&asm, "main");
    let ret = main.find(".main_ret:").unwrap();
    let prologue: Vec<&str> = main[..ret]
        .lines()
        .take_while(|l| l.starts_with('\t') || l.ends_with(':'))
        .filter(|l| l.starts_with("\tsd\t"))
        .collect();
    for line in &prologue {
        assert!(
            line.starts_with("\tsd\tra,") || line.starts_with("\tsd\ts"),
            "caller-saved register saved in prologue: {line}"
        );
    }
}

#[test]
fn heavy_expression_pressure_spills_to_the_frame() {
    let src = "
        int main() {
            int x = getint();
            return x + (x + (x + (x + (x + (x + (x + (x + (x + (x + (x
                 + (x + (x + (x + (x + (x + (x + (x + (x + x))))))))))))))))));
        }
    ";
    let asm = assemble(src);
    let main = function_text(&asm, "main");
    // spilled values round-trip through the reserved scratch registers
    assert!(main.contains("\tsd\tt5, "));
    assert!(main.contains("\tld\tt5, "));
    assert_eq!(frame_size(main) % 16, 0);
}

#[test]
fn globals_emit_words_and_zero_runs() {
    let src = "
        int g1 = 5;
        float gf = 2.0;
        int arr[8] = {1, 2, 3};
        int main() { return g1 + arr[2]; }
    ";
    let asm = assemble(src);
    assert!(asm.starts_with("\t.data\n"));
    assert!(asm.contains("\t.type\tg1,@object"));
    assert!(asm.contains("\t.globl\tg1"));
    assert!(asm.contains("g1:\n\t.word\t5"));
    assert!(asm.contains("\t.size\tg1, 4"));
    assert!(asm.contains(&format!("\t.word\t{}", 2.0f32.to_bits() as i32)));
    assert!(asm.contains("\t.word\t1\n\t.word\t2\n\t.word\t3\n\t.zero\t20"));
    assert!(asm.contains("\t.size\tarr, 32"));
    // globals are addressed symbolically
    let main = function_text(&asm, "main");
    assert!(main.contains(", g1"));
    assert!(main.contains(", arr"));
    // .data precedes .text
    assert!(asm.find("\t.data").unwrap() < asm.find("\t.text").unwrap());
}

#[test]
fn float_equality_feeding_a_conversion_splits_control_flow() {
    let src = "
        int main() {
            float a = getfloat();
            float b = getfloat();
            float c = (a == b);
            putfloat(c);
            return 0;
        }
    ";
    let asm = assemble(src);
    let main = function_text(&asm, "main");
    assert!(main.contains("\tfeq.s\t"));
    // no direct conversion of the comparison flag
    assert!(!main.contains("\tfcvt.s.w\t"));
    // instead 1.0 is loaded on one path and 0.0 materialized on the other
    assert!(main.contains("\tfmv.w.x\t"));
    assert!(main.lines().any(|l| l.starts_with("\tbeq\t") && l.contains(", zero, ")));
    assert!(asm.contains(&format!("\t.word\t{}", 1.0f32.to_bits() as i32)));
}

#[test]
fn integer_comparisons_use_slt_forms() {
    let asm = assemble("int main() { int x = getint(); return x < 5; }");
    let main = function_text(&asm, "main");
    assert!(main.contains("\tslti\t"));

    let asm = assemble("int main() { int x = getint(); return x >= 5; }");
    let main = function_text(&asm, "main");
    // x >= 5 becomes slt 4 < x
    assert!(main.contains("\tli\tt0, 4") || main.contains("\tslt\t"));

    let asm = assemble("int main() { int x = getint(); int y = getint(); return x <= y; }");
    let main = function_text(&asm, "main");
    assert!(main.contains("\tslt\t"));
    assert!(main.contains("\txori\t"));
    assert!(main.lines().any(|l| l.starts_with("\txori\t") && l.ends_with(", 1")));
}

#[test]
fn equality_tests_reduce_to_seqz_and_snez() {
    let asm = assemble("int main() { int x = getint(); return x == 7; }");
    assert!(function_text(&asm, "main").contains("\tseqz\t"));

    let asm = assemble("int main() { int x = getint(); return x != 7; }");
    assert!(function_text(&asm, "main").contains("\tsnez\t"));
}

#[test]
fn division_and_modulo_use_word_forms() {
    let asm = assemble(
        "int main() { int x = getint(); int y = getint(); return x / y + x % y; }",
    );
    let main = function_text(&asm, "main");
    assert!(main.contains("\tdivw\t"));
    assert!(main.contains("\tremw\t"));
}

#[test]
fn float_arithmetic_uses_single_precision_ops() {
    let src = "
        int main() {
            float a = getfloat();
            float b = getfloat();
            putfloat(a * b + a / b - b);
            return 0;
        }
    ";
    let asm = assemble(src);
    let main = function_text(&asm, "main");
    for op in ["\tfmul.s\t", "\tfdiv.s\t", "\tfadd.s\t", "\tfsub.s\t"] {
        assert!(main.contains(op), "missing {op}");
    }
    assert!(main.contains("\tfmv.s\tfa0, "));
}

#[test]
fn conversions_round_trip_through_fcvt() {
    let src = "
        int main() {
            float f = getfloat();
            int i = f;
            float g = i * 2;
            putfloat(g);
            return i;
        }
    ";
    let asm = assemble(src);
    let main = function_text(&asm, "main");
    assert!(main.contains("\tfcvt.w.s\t"));
    assert!(main.contains(", rtz"));
    assert!(main.contains("\tfcvt.s.w\t"));
}

#[test]
fn array_parameters_index_through_the_loaded_pointer() {
    let src = "
        int first(int a[]) {
            return a[0] + a[1];
        }
        int main() {
            int buf[4] = {10, 20, 30, 40};
            return first(buf);
        }
    ";
    let asm = assemble(src);
    let first = function_text(&asm, "first");
    // the pointer parameter is spilled and reloaded as a doubleword
    assert!(first.contains("\tsd\ta0, "));
    assert!(first.contains("\tld\t"));
    // the local array decays to an address in the caller
    let main = function_text(&asm, "main");
    assert!(main.contains("\taddi\t") && main.contains("\tmv\ta0, "));
}

#[test]
fn stack_pointer_delta_is_balanced() {
    let src = "
        int main() {
            int a[100];
            a[getint()] = 1;
            return 0;
        }
    ";
    let asm = assemble(src);
    let main = function_text(&asm, "main");
    // every sp adjustment in the prologue has a mirror in the epilogue
    let bumps: Vec<&str> = main
        .lines()
        .filter(|l| l.contains("\tsp, sp, "))
        .collect();
    let down: i64 = bumps
        .iter()
        .filter_map(|l| l.rsplit(' ').next().unwrap().parse::<i64>().ok())
        .sum();
    // li/add pairs cancel likewise; here the frame fits the small form,
    // so the two addi immediates must cancel exactly
    assert_eq!(down, 0, "unbalanced sp adjustments: {bumps:?}");
}
