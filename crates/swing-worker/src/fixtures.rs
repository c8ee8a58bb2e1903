//! Vat bundles shipped with the worker binary and used by the test suites.
//!
//! `faulty.hang` never returns: only deliver it to vats with a delivery
//! timeout.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use swing_liveslots::{BundleRegistry, Far, LiveSlotsError, Value, VatContext, arg};

/// Every bundle, by name.
pub fn registry() -> BundleRegistry {
    let mut registry = BundleRegistry::new();
    registry
        .register("echo", |vat, _| Ok(echo(vat)))
        .register("pipeline-resolver", |vat, _| Ok(pipeline_resolver(vat)))
        .register("pipeline-follower", |vat, _| Ok(pipeline_follower(vat)))
        .register("faulty", |vat, _| Ok(faulty(vat)))
        .register("vatstore", |vat, _| Ok(vatstore(vat)))
        .register("boot-counter", boot_counter)
        .register("timekeeper", |vat, _| Ok(timekeeper(vat)))
        .register("gc", |vat, _| Ok(collector(vat)));
    registry
}

fn vat_error(err: LiveSlotsError) -> Value {
    Value::error(err.to_string())
}

fn string_arg(args: &[Value], index: usize) -> Result<String, Value> {
    arg(args, index)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| Value::type_error(format!("argument {index} must be a string")))
}

type Held = Arc<Mutex<Vec<Value>>>;

fn held(slot: &Held) -> std::sync::MutexGuard<'_, Vec<Value>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn echo(vat: &mut VatContext) -> Value {
    vat.make_far(
        Far::new("echo")
            .method("echo", |_vat, args| Ok(args.into_iter().next().unwrap_or(Value::Undefined)))
            .method("log", |vat, args| {
                let line = string_arg(&args, 0)?;
                vat.console(&line);
                Ok(Value::Undefined)
            })
            // send(target, method, ...args)
            .method("send", |vat, args| {
                let target = arg(&args, 0)?.clone();
                let method = string_arg(&args, 1)?;
                let rest = args.into_iter().skip(2).collect();
                Ok(vat.send(&target, &method, rest))
            }),
    )
}

/// Hands a fresh promise to another vat, then resolves it to a local object.
fn pipeline_resolver(vat: &mut VatContext) -> Value {
    vat.make_far(Far::new("resolver").method("start", |vat, args| {
        let follower = arg(&args, 0)?.clone();
        let promise = vat.make_promise();
        vat.send_only(&follower, "one", vec![promise.clone()]);
        let target = vat.make_far(
            Far::new("target").method("foo", |_vat, _args| Ok(Value::from("foo called"))),
        );
        vat.resolve(&promise, target);
        Ok(Value::Undefined)
    }))
}

/// Holds the promise it is given and later sends `foo` to it.
fn pipeline_follower(vat: &mut VatContext) -> Value {
    let slot: Held = Arc::default();
    let keep = Arc::clone(&slot);
    vat.make_far(
        Far::new("follower")
            .method("one", move |_vat, args| {
                held(&keep).push(arg(&args, 0)?.clone());
                Ok(Value::Undefined)
            })
            .method("two", move |vat, _args| {
                let target = held(&slot)
                    .last()
                    .cloned()
                    .ok_or_else(|| Value::error("one() was never called"))?;
                Ok(vat.send(&target, "foo", vec![]))
            }),
    )
}

fn faulty(vat: &mut VatContext) -> Value {
    vat.make_far(
        Far::new("faulty")
            .method("ok", |_vat, _args| Ok(Value::from("fine")))
            .method("fail", |_vat, _args| Err(Value::error("deliberate failure")))
            .method("die", |_vat, _args| panic!("worker told to die"))
            .method("hang", |_vat, _args| loop {
                std::thread::sleep(Duration::from_secs(3600));
            })
            .method("overspend", |vat, args| {
                let computrons = arg(&args, 0)?.as_i64().unwrap_or(0).max(0) as u64;
                vat.charge(computrons).map_err(vat_error)?;
                Ok(Value::Undefined)
            })
            .method("quit", |vat, args| {
                let completion = args.into_iter().next().unwrap_or(Value::Undefined);
                vat.exit_vat(completion).map_err(vat_error)?;
                Ok(Value::Undefined)
            })
            .method("abort", |vat, args| {
                let reason = args.into_iter().next().unwrap_or(Value::Undefined);
                vat.exit_vat_with_failure(reason).map_err(vat_error)?;
                Ok(Value::Undefined)
            }),
    )
}

fn vatstore(vat: &mut VatContext) -> Value {
    vat.make_far(
        Far::new("vatstore")
            .method("put", |vat, args| {
                let key = string_arg(&args, 0)?;
                let value = string_arg(&args, 1)?;
                vat.vatstore_set(&key, &value).map_err(vat_error)?;
                Ok(Value::Undefined)
            })
            .method("get", |vat, args| {
                let key = string_arg(&args, 0)?;
                Ok(vat
                    .vatstore_get(&key)
                    .map_err(vat_error)?
                    .map(Value::from)
                    .unwrap_or(Value::Null))
            })
            .method("delete", |vat, args| {
                let key = string_arg(&args, 0)?;
                vat.vatstore_delete(&key).map_err(vat_error)?;
                Ok(Value::Undefined)
            })
            // Keys under a prefix, walked one getAfter at a time.
            .method("list", |vat, args| {
                let prefix = string_arg(&args, 0)?;
                let mut keys = Vec::new();
                let mut prior = String::new();
                while let Some((key, _)) = vat
                    .vatstore_get_after(&prior, &prefix, None)
                    .map_err(vat_error)?
                {
                    keys.push(Value::from(key.as_str()));
                    prior = key;
                }
                Ok(Value::List(keys))
            }),
    )
}

/// Counts its own startups in the vatstore while building the root.
fn boot_counter(vat: &mut VatContext, _params: &serde_json::Value) -> Result<Value, LiveSlotsError> {
    let boots = vat
        .vatstore_get("boots")?
        .and_then(|count| count.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    vat.vatstore_set("boots", &boots.to_string())?;
    Ok(vat.make_far(Far::new("boot-counter").method("boots", move |_, _| {
        Ok(Value::from(boots.to_string().as_str()))
    })))
}

fn timekeeper(vat: &mut VatContext) -> Value {
    vat.make_far(Far::new("timekeeper").method("now", |vat, args| {
        let clock = arg(&args, 0)?.clone();
        vat.call_now(&clock, "now", vec![]).map_err(vat_error)
    }))
}

/// Makes and adopts references, and lets go of all of them on `release`.
fn collector(vat: &mut VatContext) -> Value {
    let slot: Held = Arc::default();
    let on_make = Arc::clone(&slot);
    let on_adopt = Arc::clone(&slot);
    vat.make_far(
        Far::new("gc")
            .method("make", move |vat, _args| {
                let thing = vat.make_far(Far::new("thing").method("ping", |_vat, _args| Ok(Value::from("pong"))));
                held(&on_make).push(thing.clone());
                Ok(thing)
            })
            .method("adopt", move |_vat, args| {
                held(&on_adopt).push(arg(&args, 0)?.clone());
                Ok(Value::Undefined)
            })
            .method("release", move |vat, _args| {
                for value in held(&slot).drain(..) {
                    vat.forget(&value);
                }
                Ok(Value::Undefined)
            }),
    )
}
