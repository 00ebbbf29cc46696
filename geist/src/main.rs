use geist::{Runtime, Value, WeakRef, WeakValueMap};

fn main() {
    env_logger::init();

    let rt = Runtime::new();

    // direct reference: no forced pass is ever needed
    let config = rt.alloc_emittable();
    let weak = WeakRef::new(&rt, config.value()).expect("objects are referenceable");
    println!("config alive:   {:?}", weak.object());

    // weak-valued cache: entries vanish with their values
    let sessions: WeakValueMap<&str> = WeakValueMap::new(&rt);
    let session = rt.alloc();
    sessions
        .set("current", session.value())
        .expect("objects are valid map values");
    println!("cached session: {:?}", sessions.get(&"current"));

    drop(session);
    rt.collect();
    println!("after a pass:   {:?}", sessions.get(&"current"));
    println!("entries left:   {}", sessions.len());

    drop(config);
    println!("config gone:    {:?}", weak.object());

    rt.shutdown();
    println!("after shutdown: {:?}", WeakRef::new(&rt, Value::Nil).is_err());
}
