use proptest::prelude::*;
use runweave::nodes::{Lambda, passthrough};
use runweave::streaming::accumulate;
use runweave::{BatchOptions, Node, RunContext, RunError, parallel};
use serde_json::{Value, json};

fn affine(name: &str, mul: i64, add: i64) -> Node {
  Node::new(Lambda::new(name, move |v: Value| {
    let n = v.as_i64().unwrap_or(0);
    if n.abs() > 1_000_000 {
      return Err(RunError::leaf(format!("{} overflowed at {}", name_of(mul, add), n)));
    }
    Ok(json!(n * mul + add))
  }))
}

fn name_of(mul: i64, add: i64) -> String {
  format!("x*{}+{}", mul, add)
}

proptest! {
  #![proptest_config(ProptestConfig::with_cases(32))]

  #[test]
  fn pipe_grouping_does_not_change_output(x in -1000i64..1000, m in -5i64..5, k in -50i64..50) {
    let (a, b, c) = (affine("a", m, k), affine("b", 2, 1), affine("c", -1, k));
    let ctx = RunContext::new();
    let left = a.pipe(b.clone()).pipe(c.clone()).invoke(json!(x), &ctx).unwrap();
    let right = a.pipe(b.pipe(c)).invoke(json!(x), &ctx).unwrap();
    prop_assert_eq!(left, right);
  }

  #[test]
  fn batch_matches_individual_invocations(
    xs in prop::collection::vec(-2_000_000i64..2_000_000, 0..12),
    cap in 1usize..8,
  ) {
    let node = affine("f", 3, 1);
    let ctx = RunContext::new();
    let options = BatchOptions::new().with_max_concurrency(cap);
    let inputs: Vec<Value> = xs.iter().map(|x| json!(x)).collect();
    let batched = node.batch(inputs.clone(), &ctx, &options).unwrap();
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    let abatched = runtime.block_on(node.abatch(inputs.clone(), &ctx, &options)).unwrap();
    prop_assert_eq!(batched.len(), inputs.len());
    prop_assert_eq!(abatched.len(), inputs.len());
    for ((input, sync), concurrent) in inputs.into_iter().zip(batched).zip(abatched) {
      let single = node.invoke(input, &ctx);
      for result in [sync, concurrent] {
        match (&result, &single) {
          (Ok(a), Ok(b)) => prop_assert_eq!(a, b),
          (Err(a), Err(b)) => prop_assert_eq!(a.to_string(), b.to_string()),
          (a, b) => prop_assert!(false, "batched {:?} vs invoke {:?}", a, b),
        }
      }
    }
  }

  #[test]
  fn parallel_output_has_exactly_branch_keys(x in -1000i64..1000, width in 1usize..6) {
    let branches: Vec<(String, Node)> = (0..width)
      .map(|i| (format!("b{}", i), affine("branch", i as i64, 0)))
      .collect();
    let out = parallel(branches).unwrap().invoke(json!(x), &RunContext::new()).unwrap();
    let object = out.as_object().unwrap();
    prop_assert_eq!(object.len(), width);
    for i in 0..width {
      prop_assert_eq!(&object[&format!("b{}", i)], &json!(x * i as i64));
    }
  }

  #[test]
  fn passthrough_returns_input(s in ".{0,16}", n in any::<i32>()) {
    let input = json!({ "s": s, "n": n });
    prop_assert_eq!(passthrough().invoke(input.clone(), &RunContext::new()).unwrap(), input);
  }

  #[test]
  fn string_chunks_concatenate(parts in prop::collection::vec("[a-z]{0,5}", 1..8)) {
    let joined = parts
      .iter()
      .map(|p| json!(p))
      .fold(Value::Null, accumulate);
    prop_assert_eq!(joined, json!(parts.concat()));
  }
}
