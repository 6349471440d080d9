#![allow(dead_code)]

use std::sync::Arc;

use stackfold::{builtin, Config, Engine, Operand, Operator, Registry, Value};

pub fn setup_logger() {
    use std::io::Write;

    fn tn() -> String {
        std::thread::current().name().unwrap_or("unknown").to_owned()
    }

    let mut builder = env_logger::Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{:05} {:20} {:10} {}",
                record.level(),
                tn(),
                record
                    .module_path()
                    .and_then(|path| path.split("::").last())
                    .unwrap_or("?"),
                record.args()
            )
        })
        .filter(None, log::LevelFilter::Info);

    if let Ok(env) = std::env::var("RUST_LOG") {
        builder.parse_filters(&env);
    }

    let _r = builder.try_init();
}

/// Appends the operand payloads in order, wrapped as `name(...)`, so
/// tests can see exactly how operands were grouped. Has no `combine`.
pub fn tracer(name: &'static str) -> Arc<Operator> {
    Arc::new(Operator::new(name, vec![], move |base, operands, pool| {
        let mut buf = pool.copy_from(base);
        let out = buf.as_mut_vec();
        out.extend_from_slice(name.as_bytes());
        out.push(b'(');
        for operand in operands {
            out.extend_from_slice(operand);
        }
        out.push(b')');
        Ok(buf)
    }))
}

pub fn engine() -> Engine {
    engine_with(Config::default())
}

pub fn engine_with(config: Config) -> Engine {
    let registry = Registry::new(vec![
        builtin::increment(),
        builtin::concat(),
        tracer("A"),
        tracer("B"),
    ])
    .expect("registry builds");
    Engine::new(config, registry).expect("engine starts")
}

pub fn op(name: &str, payload: &str) -> Operand<'static> {
    Operand::new(name.to_owned(), payload.as_bytes().to_vec())
}

pub fn encoded(value: &Value<'_>) -> Vec<u8> {
    value.encode(None).expect("value encodes").into_vec()
}
