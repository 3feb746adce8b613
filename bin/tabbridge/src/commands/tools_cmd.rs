use tabbridge_tools::tool_pack;

/// Print the registered browser tool pack.
pub fn run() -> anyhow::Result<()> {
    let (definitions, handlers) = tool_pack();

    println!("Registered tools ({}):", definitions.len());
    println!();
    for def in &definitions {
        let covered = if handlers.contains_key(&def.name) {
            "ok"
        } else {
            "NO HANDLER"
        };
        println!("  {:<16} [{}] {}", def.name, covered, def.description);
    }
    Ok(())
}
